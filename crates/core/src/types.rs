use std::fmt;

use serde::{Deserialize, Serialize};

/// Device serial as reported by the control channel (e.g. `emulator-5554`)
pub type DeviceId = String;

/// Screen coordinate in device pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self { x: self.x + dx, y: self.y + dy }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// One captured screen frame. `data` is PNG-encoded as delivered by the device.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Build a frame from PNG bytes, reading the dimensions from the IHDR chunk.
    pub fn from_png(data: Vec<u8>) -> Self {
        let dim = |at: usize| -> u32 {
            data.get(at..at + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0)
        };
        let (width, height) = if data.starts_with(b"\x89PNG") { (dim(16), dim(20)) } else { (0, 0) };
        Self { data, width, height }
    }
}

/// Template match reported by the detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub at: Point,
    pub confidence: f64,
}

/// App package + launch activity, used for forced restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTarget {
    pub package: String,
    pub activity: String,
}

/// Lifecycle status of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstanceStatus {
    #[default]
    Running,
    Paused,
    Stopped,
    Restarting,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Run state of the orchestrator as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrchestratorState {
    Running,
    Stopping,
    #[default]
    Stopped,
}

/// Command from the TUI / stdin to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartAll,
    StopAll,
    PauseAll,
    ResumeAll,
    /// Pause or resume one instance by index
    Toggle(usize),
    /// Force a timeout-style recovery of one instance
    Restart(usize),
    /// Publish a status snapshot immediately
    Status,
    Quit,
}
