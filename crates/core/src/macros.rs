//! Macro playback collaborator. Parsing and timing of recorded macros live in
//! an external player; this module finds the recording and runs the player.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::ActionError;
use crate::platform::{check_output, run_with_timeout};
use crate::sleep::StopSignal;

pub trait MacroPlayer: Send + Sync {
    /// Play `name` on `device`, stretched by `speed`. Blocks until playback ends.
    fn play(&self, device: &str, name: &str, speed: f64, stop: &StopSignal) -> Result<(), ActionError>;
}

/// Log-only player used with the stub platform.
pub struct StubMacroPlayer;

impl MacroPlayer for StubMacroPlayer {
    fn play(&self, device: &str, name: &str, speed: f64, stop: &StopSignal) -> Result<(), ActionError> {
        info!(instance = %device, "macro '{}' (stub, speed {:.1}x)", name, speed);
        if stop.sleep_secs(0.2 * speed) {
            Ok(())
        } else {
            Err(ActionError::Cancelled)
        }
    }
}

/// Runs `<program> <macro.record> --device <id> --width <w> --height <h> --speed <s>`.
pub struct CommandMacroPlayer {
    program: Vec<String>,
    search_dirs: Vec<PathBuf>,
    resolution: (u32, u32),
    timeout: Duration,
    inter_macro_delay: f64,
}

impl CommandMacroPlayer {
    /// `command` may carry leading arguments, e.g. `python tools/macro.py`.
    pub fn new(command: &str, game_dir: &Path, global_dir: &Path) -> Self {
        Self {
            program: command.split_whitespace().map(String::from).collect(),
            search_dirs: vec![game_dir.join("macros"), global_dir.to_path_buf()],
            resolution: (540, 960),
            timeout: Duration::from_secs(300),
            inter_macro_delay: 0.0,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    pub fn with_inter_macro_delay(mut self, secs: f64) -> Self {
        self.inter_macro_delay = secs.max(0.0);
        self
    }

    /// Game-specific recordings win over shared ones.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.search_dirs
            .iter()
            .map(|dir| dir.join(format!("{}.record", name)))
            .find(|p| p.is_file())
    }
}

impl MacroPlayer for CommandMacroPlayer {
    fn play(&self, device: &str, name: &str, speed: f64, stop: &StopSignal) -> Result<(), ActionError> {
        let fail = |message: String| ActionError::Macro { name: name.to_string(), message };
        let path = self.resolve(name).ok_or_else(|| fail("recording not found".into()))?;
        let (program, args) = self.program.split_first().ok_or_else(|| fail("no macro player configured".into()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(&path)
            .args(["--device", device])
            .args(["--width", &self.resolution.0.to_string()])
            .args(["--height", &self.resolution.1.to_string()])
            .args(["--speed", &speed.to_string()])
            .env("ADB_DEVICE_ID", device);

        debug!(instance = %device, "playing {}", path.display());
        // Playback time scales with speed, so does the bound on it.
        let timeout = self.timeout.mul_f64(speed.max(1.0));
        run_with_timeout(cmd, timeout)
            .and_then(|out| check_output(program, out))
            .map_err(|e| fail(e.to_string()))?;

        if !stop.sleep_secs(self.inter_macro_delay) {
            return Err(ActionError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_game_macros() {
        let root = tempfile::tempdir().unwrap();
        let game = root.path().join("games/demo");
        let global = root.path().join("macros");
        std::fs::create_dir_all(game.join("macros")).unwrap();
        std::fs::create_dir_all(&global).unwrap();
        std::fs::write(game.join("macros/pull.record"), "{}").unwrap();
        std::fs::write(global.join("pull.record"), "{}").unwrap();
        std::fs::write(global.join("home.record"), "{}").unwrap();

        let player = CommandMacroPlayer::new("player", &game, &global);
        assert_eq!(player.resolve("pull").unwrap(), game.join("macros/pull.record"));
        assert_eq!(player.resolve("home").unwrap(), global.join("home.record"));
        assert!(player.resolve("missing").is_none());
    }

    #[test]
    fn test_missing_recording_fails_the_action() {
        let root = tempfile::tempdir().unwrap();
        let player = CommandMacroPlayer::new("player", root.path(), root.path());
        let err = player.play("emulator-5554", "nope", 1.0, &StopSignal::new()).unwrap_err();
        assert!(matches!(err, ActionError::Macro { .. }));
    }
}
