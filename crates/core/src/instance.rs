//! Per-device session data. Mutated only under the owning controller's lock.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cursor::{ActionCursor, Effects};
use crate::types::{DeviceId, InstanceStatus};

/// Time spent in the current state, excluding time spent paused.
#[derive(Debug, Clone, Copy)]
pub struct StateClock {
    entered_at: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl StateClock {
    pub fn new(now: Instant) -> Self {
        Self { entered_at: now, paused_at: None, paused_total: Duration::ZERO }
    }

    /// Restart the clock for a freshly entered state. A paused clock stays paused.
    pub fn enter(&mut self, now: Instant) {
        self.entered_at = now;
        self.paused_total = Duration::ZERO;
        if self.paused_at.is_some() {
            self.paused_at = Some(now);
        }
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += now.saturating_duration_since(at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        let end = self.paused_at.unwrap_or(now);
        end.saturating_duration_since(self.entered_at).saturating_sub(self.paused_total)
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub number: usize,
    pub device: DeviceId,
    pub state: String,
    pub cursor: ActionCursor,
    pub session_count: u64,
    pub cycle_index: u32,
    pub counter: u64,
    pub score: u64,
    pub items: Vec<String>,
    pub status: InstanceStatus,
    /// Required templates of the current state have been seen
    pub ready: bool,
    /// Bumped on every transition and recovery; stale action results are dropped
    pub generation: u64,
    pub clock: StateClock,
    pub restarts: u32,
    pub restart_pending: bool,
    pub restart_failures: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub halt_reason: Option<String>,
}

impl Instance {
    /// A new instance sits in the entry state, stopped, with its clock frozen.
    pub fn new(number: usize, device: impl Into<DeviceId>, entry: &str, now: Instant) -> Self {
        let mut clock = StateClock::new(now);
        clock.pause(now);
        Self {
            number,
            device: device.into(),
            state: entry.to_string(),
            cursor: ActionCursor::new(),
            session_count: 0,
            cycle_index: 0,
            counter: 0,
            score: 0,
            items: Vec::new(),
            status: InstanceStatus::Stopped,
            ready: false,
            generation: 0,
            clock,
            restarts: 0,
            restart_pending: false,
            restart_failures: 0,
            consecutive_failures: 0,
            last_error: None,
            halt_reason: None,
        }
    }

    pub fn enter_state(&mut self, name: &str, now: Instant) {
        self.state = name.to_string();
        self.cursor.reset();
        self.ready = false;
        self.clock.enter(now);
        self.generation += 1;
        self.consecutive_failures = 0;
    }

    pub fn apply(&mut self, effects: &Effects) {
        self.counter += effects.counter;
        self.items.extend(effects.items.iter().cloned());
    }

    pub fn record_failure(&mut self, message: String) {
        self.consecutive_failures += 1;
        self.last_error = Some(message);
    }

    pub fn begin_recovery(&mut self) {
        self.status = InstanceStatus::Restarting;
        self.generation += 1;
    }

    /// Fresh attempt at the same state. Counter, score and items are kept.
    /// An instance paused or stopped mid-recovery keeps that status.
    pub fn finish_recovery(&mut self, now: Instant) {
        self.cursor.reset();
        self.ready = false;
        self.clock.enter(now);
        self.restarts += 1;
        self.restart_pending = false;
        self.consecutive_failures = 0;
        if self.status == InstanceStatus::Restarting {
            self.status = InstanceStatus::Running;
        }
    }

    pub fn fail_recovery(&mut self, message: String) {
        self.restart_failures += 1;
        self.restart_pending = true;
        self.last_error = Some(message);
    }

    pub fn halt(&mut self, reason: String, now: Instant) {
        self.status = InstanceStatus::Stopped;
        self.clock.pause(now);
        self.halt_reason = Some(reason);
    }

    /// Start a new session: per-session accounting goes back to zero.
    pub fn reset_session(&mut self) {
        self.session_count += 1;
        self.counter = 0;
        self.score = 0;
        self.cycle_index = 0;
        self.items.clear();
    }

    pub fn snapshot(&self, now: Instant, actions: usize) -> InstanceSnapshot {
        InstanceSnapshot {
            number: self.number,
            device: self.device.clone(),
            state: self.state.clone(),
            cursor: self.cursor.position(),
            actions,
            counter: self.counter,
            score: self.score,
            session_count: self.session_count,
            cycle_index: self.cycle_index,
            elapsed_in_state: self.clock.elapsed(now).as_secs_f64(),
            status: self.status,
            ready: self.ready,
            restarts: self.restarts,
            restart_failures: self.restart_failures,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            halt_reason: self.halt_reason.clone(),
        }
    }
}

/// Copy of one instance's observable state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSnapshot {
    pub number: usize,
    pub device: DeviceId,
    pub state: String,
    pub cursor: usize,
    pub actions: usize,
    pub counter: u64,
    pub score: u64,
    pub session_count: u64,
    pub cycle_index: u32,
    /// Seconds
    pub elapsed_in_state: f64,
    pub status: InstanceStatus,
    pub ready: bool,
    pub restarts: u32,
    pub restart_failures: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub halt_reason: Option<String>,
}
