//! Error types for the automation engine

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the engine [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal or setup-level errors. Anything here halts at least one instance.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lua error: {0}")]
    Lua(String),

    #[error("invalid automation graph: {message}")]
    Graph { message: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("game not found: {}", path.display())]
    GameNotFound { path: PathBuf },

    #[error("no devices available")]
    NoDevices,

    #[error("state '{state}' selected '{target}', which is not one of {allowed:?}")]
    InvalidTransition {
        state: String,
        target: String,
        allowed: Vec<String>,
    },

    #[error("state '{0}' is not defined in the automation graph")]
    UnknownState(String),

    #[error("branch decision failed in state '{state}': {message}")]
    Branch { state: String, message: String },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl Error {
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph { message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Contract violations halt the owning instance; everything else is setup.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::InvalidTransition { .. } | Error::UnknownState(_) | Error::Branch { .. }
        )
    }
}

impl From<mlua::Error> for Error {
    fn from(e: mlua::Error) -> Self {
        Error::Lua(e.to_string())
    }
}

/// Device control channel failures
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} disconnected")]
    Disconnected(String),

    #[error("command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("command `{0}` timed out")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transient action failure. The cursor stays put and the action is retried.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("template '{template}' matched at {confidence:.2}, below {threshold:.2}")]
    LowConfidence {
        template: String,
        confidence: f64,
        threshold: f64,
    },

    #[error("waited {seconds:.1}s for '{template}'")]
    WaitTimedOut { template: String, seconds: f64 },

    #[error("macro '{name}' failed: {message}")]
    Macro { name: String, message: String },

    #[error("detector error: {0}")]
    Detector(String),

    #[error("game hook failed: {0}")]
    Game(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("cancelled")]
    Cancelled,
}

impl ActionError {
    /// Disconnections are surfaced on the status feed as channel loss.
    pub fn is_channel_loss(&self) -> bool {
        matches!(self, ActionError::Device(DeviceError::Disconnected(_)))
    }
}
