//! Device control through the `adb` command line tool.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::DeviceError;
use crate::types::*;
use super::{check_output, run_with_timeout, DeviceChannel, Platform};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AdbPlatform {
    adb: String,
}

impl AdbPlatform {
    pub fn new(adb: &str) -> Self {
        Self { adb: adb.to_string() }
    }
}

/// Parse `adb devices` output, keeping only devices in the `device` state.
pub fn parse_devices(output: &str) -> Vec<DeviceId> {
    output
        .lines()
        .skip_while(|l| !l.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

impl Platform for AdbPlatform {
    fn devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        let mut cmd = Command::new(&self.adb);
        cmd.arg("devices");
        let output = check_output("adb devices", run_with_timeout(cmd, COMMAND_TIMEOUT)?)?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    fn open(&self, device: &str) -> Result<Box<dyn DeviceChannel>, DeviceError> {
        Ok(Box::new(AdbDevice { adb: self.adb.clone(), serial: device.to_string() }))
    }
}

struct AdbDevice {
    adb: String,
    serial: String,
}

impl AdbDevice {
    fn run(&self, args: &[&str], timeout: Duration) -> Result<Vec<u8>, DeviceError> {
        let label = args.join(" ");
        debug!(instance = %self.serial, "adb {}", label);
        let mut cmd = Command::new(&self.adb);
        cmd.arg("-s").arg(&self.serial).args(args);
        let output = run_with_timeout(cmd, timeout)?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("offline") || stderr.contains("no devices") {
            return Err(DeviceError::Disconnected(self.serial.clone()));
        }
        Ok(check_output(&label, output)?.stdout)
    }

    fn shell(&self, args: &[&str]) -> Result<(), DeviceError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run(&full, COMMAND_TIMEOUT).map(|_| ())
    }
}

/// `input text` needs spaces as `%s` and shell metacharacters escaped.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            ' ' => out.push_str("%s"),
            '\'' | '"' | '\\' | '&' | '|' | ';' | '<' | '>' | '(' | ')' | '$' | '`' | '*' | '?' | '#' | '~' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

impl DeviceChannel for AdbDevice {
    fn id(&self) -> &str {
        &self.serial
    }

    fn tap(&mut self, at: Point) -> Result<(), DeviceError> {
        self.shell(&["input", "tap", &at.x.to_string(), &at.y.to_string()])
    }

    fn swipe(&mut self, from: Point, to: Point, duration_ms: u64) -> Result<(), DeviceError> {
        self.shell(&[
            "input",
            "swipe",
            &from.x.to_string(),
            &from.y.to_string(),
            &to.x.to_string(),
            &to.y.to_string(),
            &duration_ms.to_string(),
        ])
    }

    fn type_text(&mut self, text: &str) -> Result<(), DeviceError> {
        self.shell(&["input", "text", &escape_text(text)])
    }

    fn press_key(&mut self, code: &str) -> Result<(), DeviceError> {
        self.shell(&["input", "keyevent", code])
    }

    fn restart_app(&mut self, app: &AppTarget, timeout: Duration) -> Result<(), DeviceError> {
        self.run(&["shell", "am", "force-stop", &app.package], timeout)?;
        self.run(&["shell", "am", "start", "-n", &app.activity], timeout)?;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, DeviceError> {
        let png = self.run(&["exec-out", "screencap", "-p"], COMMAND_TIMEOUT)?;
        if png.is_empty() {
            return Err(DeviceError::CommandFailed {
                command: "exec-out screencap -p".into(),
                message: "empty capture".into(),
            });
        }
        Ok(Frame::from_png(png))
    }
}
