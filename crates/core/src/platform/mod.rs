pub mod adb;
pub mod stub;

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::DeviceError;
use crate::logger;
use crate::types::*;

/// Control channel for one device. Owned by exactly one instance.
pub trait DeviceChannel: Send {
    fn id(&self) -> &str;
    fn tap(&mut self, at: Point) -> Result<(), DeviceError>;
    fn swipe(&mut self, from: Point, to: Point, duration_ms: u64) -> Result<(), DeviceError>;
    fn type_text(&mut self, text: &str) -> Result<(), DeviceError>;
    fn press_key(&mut self, code: &str) -> Result<(), DeviceError>;
    fn restart_app(&mut self, app: &AppTarget, timeout: Duration) -> Result<(), DeviceError>;
    fn capture_frame(&mut self) -> Result<Frame, DeviceError>;
}

/// Platform-level operations (device enumeration, channel factory).
pub trait Platform: Send + Sync {
    fn devices(&self) -> Result<Vec<DeviceId>, DeviceError>;
    fn open(&self, device: &str) -> Result<Box<dyn DeviceChannel>, DeviceError>;
}

/// Create the platform for this run: simulated devices or adb.
pub fn create_platform(force_stub: bool, stub_devices: usize, adb_path: &str) -> Box<dyn Platform> {
    if force_stub {
        logger::register_prefix("stub", logger::COLOR_GRAY);
        return Box::new(stub::StubPlatform::new(stub_devices));
    }
    logger::register_prefix("adb", logger::COLOR_GRAY);
    Box::new(adb::AdbPlatform::new(adb_path))
}

/// Run an external command, killing it when `timeout` elapses.
pub(crate) fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Output, DeviceError> {
    let label = format!("{:?}", cmd);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes on helper threads so a chatty child can't block on a full pipe.
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let out_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(s) = stdout.as_mut() {
            s.read_to_end(&mut buf).ok();
        }
        buf
    });
    let err_reader = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(s) = stderr.as_mut() {
            s.read_to_end(&mut buf).ok();
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().ok();
            child.wait().ok();
            return Err(DeviceError::Timeout(label));
        }
        thread::sleep(Duration::from_millis(20));
    };

    Ok(Output {
        status,
        stdout: out_reader.join().unwrap_or_default(),
        stderr: err_reader.join().unwrap_or_default(),
    })
}

/// Turn a non-zero exit into `CommandFailed` with the captured stderr.
pub(crate) fn check_output(command: &str, output: Output) -> Result<Output, DeviceError> {
    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() { format!("exit status {}", output.status) } else { stderr };
        Err(DeviceError::CommandFailed { command: command.to_string(), message })
    }
}
