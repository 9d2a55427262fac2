//! Outbound status and notification sinks. Neither ever blocks an instance.

use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::instance::InstanceSnapshot;
use crate::lock;
use crate::types::{DeviceId, InstanceStatus, OrchestratorState};

/// Aggregated view of every instance, published on a fixed interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestratorSnapshot {
    pub game: String,
    pub state: OrchestratorState,
    /// Seconds since the orchestrator started
    pub elapsed: f64,
    pub total_sessions: u64,
    pub sessions_per_hour: f64,
    pub instances: Vec<InstanceSnapshot>,
}

impl OrchestratorSnapshot {
    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, snapshot: &OrchestratorSnapshot);
}

/// One summary line plus one line per instance.
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn publish(&self, s: &OrchestratorSnapshot) {
        info!(
            "{}: {} running, {} paused, {} sessions ({:.1}/h) in {:.0}s",
            s.game,
            s.count(InstanceStatus::Running),
            s.count(InstanceStatus::Paused),
            s.total_sessions,
            s.sessions_per_hour,
            s.elapsed
        );
        for i in &s.instances {
            match &i.halt_reason {
                Some(reason) => warn!(instance = %i.device, "{} in '{}': {}", i.status, i.state, reason),
                None => info!(
                    instance = %i.device,
                    "{} '{}' {}/{} for {:.0}s | counter {} score {} cycle {} sessions {}",
                    i.status, i.state, i.cursor, i.actions, i.elapsed_in_state,
                    i.counter, i.score, i.cycle_index, i.session_count
                ),
            }
        }
    }
}

/// Rewrites a JSON file with the latest snapshot.
pub struct JsonStatusSink {
    path: PathBuf,
}

impl JsonStatusSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusSink for JsonStatusSink {
    fn publish(&self, snapshot: &OrchestratorSnapshot) {
        let result = serde_json::to_string_pretty(snapshot)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&self.path, json));
        if let Err(e) = result {
            warn!("failed to write {}: {}", self.path.display(), e);
        }
    }
}

/// Latest snapshot in a shared slot, read by the TUI.
#[derive(Clone, Default)]
pub struct SharedStatus {
    slot: Arc<Mutex<Option<OrchestratorSnapshot>>>,
}

impl SharedStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<OrchestratorSnapshot> {
        lock(&self.slot).clone()
    }
}

impl StatusSink for SharedStatus {
    fn publish(&self, snapshot: &OrchestratorSnapshot) {
        *lock(&self.slot) = Some(snapshot.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    SessionCompleted {
        device: DeviceId,
        session: u64,
        score: u64,
        counter: u64,
        cycles: u32,
        items: Vec<String>,
    },
    HighScore {
        device: DeviceId,
        session: u64,
        score: u64,
        threshold: u64,
    },
    InstanceHalted {
        device: DeviceId,
        reason: String,
    },
    RestartFailed {
        device: DeviceId,
        attempts: u32,
        error: String,
    },
}

/// Fire-and-forget event delivery.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n {
            Notification::SessionCompleted { device, session, score, cycles, .. } => {
                info!(instance = %device, "session {} finished: score {} over {} cycles", session, score, cycles)
            }
            Notification::HighScore { device, session, score, threshold } => {
                info!(instance = %device, "high score {} in session {} (threshold {})", score, session, threshold)
            }
            Notification::InstanceHalted { device, reason } => warn!(instance = %device, "halted: {}", reason),
            Notification::RestartFailed { device, attempts, error } => {
                warn!(instance = %device, "restart failed ({} so far): {}", attempts, error)
            }
        }
    }
}

/// Forwards notifications to a receiver owned by another thread. Unbounded, so
/// sending never waits; a dropped receiver is ignored.
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        self.tx.send(notification).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_sink_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let snapshot = OrchestratorSnapshot { game: "demo".into(), total_sessions: 3, ..Default::default() };
        JsonStatusSink::new(&path).publish(&snapshot);
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["game"], "demo");
        assert_eq!(v["total_sessions"], 3);
    }

    #[test]
    fn test_channel_notifier_survives_dropped_receiver() {
        let (tx, rx) = mpsc::channel();
        let n = ChannelNotifier::new(tx);
        n.notify(Notification::InstanceHalted { device: "d".into(), reason: "x".into() });
        assert!(matches!(rx.recv().unwrap(), Notification::InstanceHalted { .. }));
        drop(rx);
        n.notify(Notification::InstanceHalted { device: "d".into(), reason: "y".into() });
    }

    #[test]
    fn test_shared_status_keeps_latest() {
        let shared = SharedStatus::new();
        assert!(shared.latest().is_none());
        shared.publish(&OrchestratorSnapshot { total_sessions: 1, ..Default::default() });
        shared.publish(&OrchestratorSnapshot { total_sessions: 2, ..Default::default() });
        assert_eq!(shared.latest().unwrap().total_sessions, 2);
    }
}
