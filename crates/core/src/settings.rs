use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::sleep::duration_secs;

/// Persisted defaults, `settings.json` in the working directory.
/// Command line flags override them for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub speed_multiplier: f64,
    pub max_instances: usize,
    /// Seconds between macro playbacks
    pub inter_macro_delay: f64,
    pub status_interval_secs: f64,
    pub watchdog_interval_secs: f64,
    pub tick_interval_secs: f64,
    pub adb_path: String,
    /// External template matcher, required unless running with `--stub`
    pub detector_command: Option<String>,
    pub macro_command: Option<String>,
    /// Screen size the macro recordings were captured at
    pub macro_resolution: (u32, u32),
    pub games_dir: PathBuf,
    pub device_pattern: Option<String>,
    pub last_game: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            speed_multiplier: 2.4,
            max_instances: 8,
            inter_macro_delay: 1.0,
            status_interval_secs: 5.0,
            watchdog_interval_secs: 5.0,
            tick_interval_secs: 0.5,
            adb_path: "adb".into(),
            detector_command: None,
            macro_command: None,
            macro_resolution: (540, 960),
            games_dir: PathBuf::from("games"),
            device_pattern: None,
            last_game: None,
        }
    }
}

impl Settings {
    /// Missing or unreadable files fall back to defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("ignoring {}: {}", path.display(), e);
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Resolved runtime configuration handed to the orchestrator and controllers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Stretches macro playback, settle waits and state timeouts
    pub speed: f64,
    /// Yield between two ticks of one instance (jittered)
    pub tick_interval: f64,
    pub watchdog_interval: Duration,
    pub status_interval: Duration,
    /// Overrides the game's cycles per session
    pub cycles: Option<u32>,
    /// Base wait before reading items after an action, times `speed`
    pub item_settle: f64,
    /// Base pause after a completed session, times `speed`
    pub session_cooldown: f64,
    /// Force an app restart before an instance's first tick
    pub restart_on_start: bool,
    /// Return from the orchestrator loop once every instance has stopped
    pub exit_when_idle: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            speed: 2.4,
            tick_interval: 0.5,
            watchdog_interval: Duration::from_secs(5),
            status_interval: Duration::from_secs(5),
            cycles: None,
            item_settle: 2.0,
            session_cooldown: 3.0,
            restart_on_start: false,
            exit_when_idle: false,
        }
    }
}

impl RunConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            speed: s.speed_multiplier,
            tick_interval: s.tick_interval_secs,
            watchdog_interval: duration_secs(s.watchdog_interval_secs.max(0.1)),
            status_interval: duration_secs(s.status_interval_secs.max(0.1)),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.speed.is_finite() || self.speed < 0.1 {
            return Err(Error::config(format!("speed multiplier must be at least 0.1, got {}", self.speed)));
        }
        let intervals = [self.tick_interval, self.item_settle, self.session_cooldown];
        if intervals.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::config("intervals must not be negative"));
        }
        if self.cycles == Some(0) {
            return Err(Error::config("cycles per session must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Settings::load(&dir.path().join("nope.json")), Settings::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_instances": 3, "adb_path": "/opt/adb"}"#).unwrap();
        let s = Settings::load(&path);
        assert_eq!(s.max_instances, 3);
        assert_eq!(s.adb_path, "/opt/adb");
        assert_eq!(s.speed_multiplier, 2.4);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = Settings { last_game: Some("gacha-demo".into()), ..Settings::default() };
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).last_game.as_deref(), Some("gacha-demo"));
    }

    #[test]
    fn test_run_config_validation() {
        assert!(RunConfig::default().validate().is_ok());
        assert!(RunConfig { speed: 0.05, ..RunConfig::default() }.validate().is_err());
        assert!(RunConfig { cycles: Some(0), ..RunConfig::default() }.validate().is_err());
    }
}
