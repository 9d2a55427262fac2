//! Timeout watchdog. Forces an app restart when an instance has spent longer
//! in its state than the state's timeout scaled by the speed multiplier, or
//! when a restart was requested explicitly.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::controller::InstanceController;
use crate::lock;
use crate::sink::Notification;
use crate::sleep::StopSignal;
use crate::types::InstanceStatus;

const RESTART_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Restarted,
    Failed,
}

pub struct RecoverySupervisor {
    controllers: Vec<Arc<InstanceController>>,
    interval: Duration,
    stop: StopSignal,
}

impl RecoverySupervisor {
    pub fn new(controllers: Vec<Arc<InstanceController>>, interval: Duration) -> Self {
        Self { controllers, interval, stop: StopSignal::new() }
    }

    /// Check every instance once. Returns what was done, per device. A panic
    /// while recovering one instance is logged and does not end the pass.
    pub fn check_all(&self) -> Vec<(String, Recovery)> {
        self.controllers
            .iter()
            .filter_map(|c| match panic::catch_unwind(AssertUnwindSafe(|| check(c))) {
                Ok(done) => done.map(|r| (c.device_id().to_string(), r)),
                Err(_) => {
                    error!(instance = %c.device_id(), "watchdog check panicked");
                    None
                }
            })
            .collect()
    }

    /// Run `check_all` on a fixed interval until [`RecoverySupervisor::shutdown`].
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let me = Arc::clone(self);
        thread::Builder::new().name("watchdog".into()).spawn(move || {
            debug!("watchdog every {:.1}s", me.interval.as_secs_f64());
            while me.stop.sleep(me.interval) {
                me.check_all();
            }
        })
    }

    pub fn shutdown(&self) {
        self.stop.raise();
    }
}

/// Recover one instance if it is due.
pub fn check(c: &InstanceController) -> Option<Recovery> {
    let rt = c.runtime();
    let (state, reason) = {
        let now = rt.clock.now();
        let mut inst = c.instance();
        let reason = match inst.status {
            InstanceStatus::Running | InstanceStatus::Restarting if inst.restart_pending => "restart requested".to_string(),
            InstanceStatus::Running => {
                let limit = rt.graph.get(&inst.state)?.effective_timeout(rt.config.speed)?;
                let elapsed = inst.clock.elapsed(now);
                if elapsed <= limit {
                    return None;
                }
                format!("{:.1}s in '{}' exceeds {:.1}s", elapsed.as_secs_f64(), inst.state, limit.as_secs_f64())
            }
            _ => return None,
        };
        inst.begin_recovery();
        (inst.state.clone(), reason)
    };

    warn!(instance = %c.device_id(), "{}, restarting app", reason);
    let result = lock(c.device()).restart_app(rt.game.app(), RESTART_TIMEOUT);

    let now = rt.clock.now();
    let mut inst = c.instance();
    match result {
        Ok(()) => {
            inst.finish_recovery(now);
            info!(instance = %c.device_id(), "restarted, retrying '{}' (restart #{})", state, inst.restarts);
            Some(Recovery::Restarted)
        }
        Err(e) => {
            inst.fail_recovery(e.to_string());
            let attempts = inst.restart_failures;
            drop(inst);
            error!(instance = %c.device_id(), "app restart failed, retrying next pass: {}", e);
            rt.notifier.notify(Notification::RestartFailed {
                device: c.device_id().to_string(),
                attempts,
                error: e.to_string(),
            });
            Some(Recovery::Failed)
        }
    }
}
