use std::time::Duration;

use tracing::debug;

use crate::error::DeviceError;
use crate::types::*;
use super::{DeviceChannel, Platform};

/// Simulated devices for dry runs (`--stub`). Every call is logged and succeeds.
pub struct StubPlatform {
    count: usize,
}

impl StubPlatform {
    pub fn new(count: usize) -> Self {
        Self { count: count.max(1) }
    }
}

impl Platform for StubPlatform {
    fn devices(&self) -> Result<Vec<DeviceId>, DeviceError> {
        // Same serial scheme as local emulators: 5554, 5556, ...
        Ok((0..self.count).map(|i| format!("emulator-{}", 5554 + 2 * i)).collect())
    }

    fn open(&self, device: &str) -> Result<Box<dyn DeviceChannel>, DeviceError> {
        debug!(instance = "stub", "open(\"{}\")", device);
        Ok(Box::new(StubDevice { id: device.to_string(), width: 540, height: 960 }))
    }
}

struct StubDevice {
    id: String,
    width: u32,
    height: u32,
}

impl DeviceChannel for StubDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn tap(&mut self, at: Point) -> Result<(), DeviceError> {
        debug!(instance = "stub", "{}.tap{}", self.id, at);
        Ok(())
    }

    fn swipe(&mut self, from: Point, to: Point, duration_ms: u64) -> Result<(), DeviceError> {
        debug!(instance = "stub", "{}.swipe{} -> {} in {}ms", self.id, from, to, duration_ms);
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<(), DeviceError> {
        debug!(instance = "stub", "{}.type_text(\"{}\")", self.id, text);
        Ok(())
    }

    fn press_key(&mut self, code: &str) -> Result<(), DeviceError> {
        debug!(instance = "stub", "{}.press_key({})", self.id, code);
        Ok(())
    }

    fn restart_app(&mut self, app: &AppTarget, _timeout: Duration) -> Result<(), DeviceError> {
        debug!(instance = "stub", "{}.restart_app({})", self.id, app.package);
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame, DeviceError> {
        Ok(Frame { data: Vec::new(), width: self.width, height: self.height })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_devices_use_emulator_serials() {
        let p = StubPlatform::new(3);
        assert_eq!(p.devices().unwrap(), vec!["emulator-5554", "emulator-5556", "emulator-5558"]);
    }

    #[test]
    fn test_stub_frames_have_device_size() {
        let p = StubPlatform::new(1);
        let mut d = p.open("emulator-5554").unwrap();
        let f = d.capture_frame().unwrap();
        assert_eq!((f.width, f.height), (540, 960));
        assert_eq!(d.id(), "emulator-5554");
    }
}
