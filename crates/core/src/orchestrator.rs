use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{error, info, warn};

use crate::controller::{InstanceController, Runtime};
use crate::error::{Error, Result};
use crate::lock;
use crate::logger;
use crate::lua_rt::{GameInfo, LuaGame};
use crate::platform::{DeviceChannel, Platform};
use crate::recovery::RecoverySupervisor;
use crate::sink::{OrchestratorSnapshot, StatusSink};
use crate::types::*;

/// Recursively find all `main.lua` scripts under `dir`.
pub fn find_games(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return results,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            let name = path.file_name().unwrap_or_default().to_string_lossy();
            if !name.starts_with('.') && name != "macros" {
                let main_lua = path.join("main.lua");
                if main_lua.is_file() {
                    results.push(main_lua);
                } else {
                    results.extend(find_games(&path));
                }
            }
        }
    }
    results.sort();
    results
}

/// Derive game name from its script path: games/gacha-demo/main.lua -> gacha-demo
pub fn derive_game_name(path: &Path, root: &Path) -> String {
    let game_dir = path.parent().unwrap_or(path);
    let rel = game_dir.strip_prefix(root).unwrap_or(game_dir);
    rel.to_string_lossy().replace('\\', "/")
}

/// Describe every game under `games_dir`; broken scripts are logged and skipped.
pub fn list_games(games_dir: &Path) -> Vec<(PathBuf, GameInfo)> {
    let mut games = Vec::new();
    for path in find_games(games_dir) {
        let name = derive_game_name(&path, games_dir);
        match LuaGame::describe(&path) {
            Ok(info) => games.push((path, info)),
            Err(e) => error!("failed to load game {}: {}", name, e),
        }
    }
    games
}

/// Path of the script for game `name`.
pub fn game_script(games_dir: &Path, name: &str) -> Result<PathBuf> {
    let path = games_dir.join(name).join("main.lua");
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::GameNotFound { path })
    }
}

/// Explicit devices win; otherwise every connected device matching `pattern`,
/// capped at `max`.
pub fn resolve_devices(
    platform: &dyn Platform,
    explicit: &[String],
    pattern: Option<&Regex>,
    max: usize,
) -> Result<Vec<DeviceId>> {
    let devices: Vec<DeviceId> = if explicit.is_empty() {
        platform
            .devices()?
            .into_iter()
            .filter(|d| pattern.map_or(true, |re| re.is_match(d)))
            .take(max)
            .collect()
    } else {
        explicit.to_vec()
    };
    if devices.is_empty() {
        return Err(Error::NoDevices);
    }
    Ok(devices)
}

/// Owns one controller per device plus the watchdog, and turns commands into
/// controller calls. Never holds more than one instance lock at a time.
pub struct Orchestrator {
    runtime: Arc<Runtime>,
    controllers: Vec<Arc<InstanceController>>,
    by_device: HashMap<DeviceId, usize>,
    supervisor: Arc<RecoverySupervisor>,
    sinks: Vec<Arc<dyn StatusSink>>,
    state: Mutex<OrchestratorState>,
    started_at: Instant,
}

impl Orchestrator {
    /// Open a channel to each device. Devices that fail to open are skipped.
    pub fn new(runtime: Arc<Runtime>, platform: &dyn Platform, devices: &[DeviceId]) -> Result<Self> {
        let mut channels = Vec::new();
        for device in devices {
            match platform.open(device) {
                Ok(ch) => channels.push(ch),
                Err(e) => warn!(instance = %device, "skipping device: {}", e),
            }
        }
        let orch = Self::from_channels(runtime, channels);
        if orch.controllers.is_empty() {
            return Err(Error::NoDevices);
        }
        Ok(orch)
    }

    /// One controller per channel. A device whose game handle cannot be
    /// created is skipped.
    pub fn from_channels(runtime: Arc<Runtime>, channels: Vec<Box<dyn DeviceChannel>>) -> Self {
        let mut controllers = Vec::new();
        let mut by_device = HashMap::new();
        for ch in channels {
            let device = ch.id().to_string();
            logger::register_prefix(&device, logger::COLOR_BLUE);
            match InstanceController::new(controllers.len() + 1, ch, Arc::clone(&runtime)) {
                Ok(c) => {
                    by_device.insert(device, controllers.len());
                    controllers.push(c);
                }
                Err(e) => warn!(instance = %device, "skipping device: {}", e),
            }
        }
        let supervisor = Arc::new(RecoverySupervisor::new(controllers.clone(), runtime.config.watchdog_interval));
        Self {
            started_at: runtime.clock.now(),
            runtime,
            controllers,
            by_device,
            supervisor,
            sinks: Vec::new(),
            state: Mutex::new(OrchestratorState::Stopped),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn controllers(&self) -> &[Arc<InstanceController>] {
        &self.controllers
    }

    pub fn controller(&self, device: &str) -> Option<&Arc<InstanceController>> {
        self.by_device.get(device).map(|&i| &self.controllers[i])
    }

    fn set_state(&self, state: OrchestratorState) {
        *lock(&self.state) = state;
    }

    pub fn state(&self) -> OrchestratorState {
        *lock(&self.state)
    }

    pub fn start_all(&self) {
        info!("starting {} instances of {}", self.controllers.len(), self.runtime.game.display_name());
        for c in &self.controllers {
            c.start();
        }
        self.set_state(OrchestratorState::Running);
    }

    pub fn stop_all(&self) {
        self.set_state(OrchestratorState::Stopping);
        for c in &self.controllers {
            c.stop();
        }
        self.set_state(OrchestratorState::Stopped);
        info!("all instances stopped");
    }

    pub fn pause_all(&self) {
        for c in &self.controllers {
            c.pause();
        }
    }

    pub fn resume_all(&self) {
        for c in &self.controllers {
            c.resume();
        }
    }

    /// Pause a running instance, resume a paused one, start a stopped one.
    pub fn toggle(&self, index: usize) {
        let Some(c) = self.controllers.get(index) else {
            warn!("no instance #{}", index + 1);
            return;
        };
        match c.status() {
            InstanceStatus::Running | InstanceStatus::Restarting => c.pause(),
            InstanceStatus::Paused => c.resume(),
            InstanceStatus::Stopped => {
                c.start();
                self.set_state(OrchestratorState::Running);
            }
        }
    }

    pub fn restart(&self, index: usize) {
        match self.controllers.get(index) {
            Some(c) => c.request_restart(),
            None => warn!("no instance #{}", index + 1),
        }
    }

    /// Copy each instance's snapshot, one lock at a time.
    pub fn snapshot(&self) -> OrchestratorSnapshot {
        let instances: Vec<_> = self.controllers.iter().map(|c| c.snapshot()).collect();
        let elapsed = self.runtime.clock.now().saturating_duration_since(self.started_at).as_secs_f64();
        let total_sessions = instances.iter().map(|i| i.session_count).sum();
        let sessions_per_hour = if elapsed > 0.0 { total_sessions as f64 * 3600.0 / elapsed } else { 0.0 };
        OrchestratorSnapshot {
            game: self.runtime.game.name().to_string(),
            state: self.state(),
            elapsed,
            total_sessions,
            sessions_per_hour,
            instances,
        }
    }

    pub fn publish(&self) -> OrchestratorSnapshot {
        let snapshot = self.snapshot();
        for sink in &self.sinks {
            sink.publish(&snapshot);
        }
        snapshot
    }

    /// Apply one command. Returns false on Quit.
    pub fn handle(&self, cmd: Command) -> bool {
        match cmd {
            Command::StartAll => self.start_all(),
            Command::StopAll => self.stop_all(),
            Command::PauseAll => self.pause_all(),
            Command::ResumeAll => self.resume_all(),
            Command::Toggle(i) => self.toggle(i),
            Command::Restart(i) => self.restart(i),
            Command::Status => {
                self.publish();
            }
            Command::Quit => {
                info!("shutting down");
                return false;
            }
        }
        true
    }

    fn all_stopped(&self) -> bool {
        self.controllers.iter().all(|c| c.status() == InstanceStatus::Stopped)
    }

    /// Main loop: commands as they arrive, status on a fixed interval, until
    /// Quit (or, with `exit_when_idle`, until every instance has stopped).
    /// Returns the final snapshot.
    pub fn run(self, cmd_rx: mpsc::Receiver<Command>) -> OrchestratorSnapshot {
        let watchdog = match self.supervisor.spawn() {
            Ok(h) => Some(h),
            Err(e) => {
                error!("failed to start watchdog: {}", e);
                None
            }
        };

        let interval = self.runtime.config.status_interval;
        let mut next_status = Instant::now() + interval;
        loop {
            let wait = next_status.saturating_duration_since(Instant::now());
            match cmd_rx.recv_timeout(wait) {
                Ok(cmd) => {
                    if !self.handle(cmd) {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    info!("command channel closed");
                    break;
                }
            }

            if Instant::now() >= next_status {
                self.publish();
                next_status = Instant::now() + interval;
            }

            if self.runtime.config.exit_when_idle && self.state() == OrchestratorState::Running && self.all_stopped() {
                info!("every instance has stopped");
                break;
            }
        }

        self.supervisor.shutdown();
        self.stop_all();
        for c in &self.controllers {
            c.join();
        }
        if let Some(h) = watchdog {
            h.join().ok();
        }

        let last = self.publish();
        self.log_summary(&last);
        last
    }

    fn log_summary(&self, s: &OrchestratorSnapshot) {
        let restarts: u32 = s.instances.iter().map(|i| i.restarts).sum();
        info!(
            "ran {} for {}: {} sessions ({:.1}/h), {} forced restarts",
            s.game,
            format_duration(Duration::from_secs_f64(s.elapsed)),
            s.total_sessions,
            s.sessions_per_hour,
            restarts
        );
        for i in &s.instances {
            info!(
                instance = %i.device,
                "#{} {} sessions, last state '{}', {} restarts{}",
                i.number,
                i.session_count,
                i.state,
                i.restarts,
                i.halt_reason.as_deref().map(|r| format!(", halted: {}", r)).unwrap_or_default()
            );
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}
