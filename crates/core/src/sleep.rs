use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::lock;

/// Source of "now" for elapsed-in-state accounting. Swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cap on any single wait built from a configured number of seconds.
pub const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Seconds from a game script or settings file as a `Duration`. NaN and
/// negative values are zero; anything past [`MAX_WAIT`] is clamped to it.
pub fn duration_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}

/// Add +/-30% random jitter to `secs` (never below 10ms).
pub fn jitter(secs: f64) -> Duration {
    if secs <= 0.0 {
        return Duration::ZERO;
    }
    let spread = secs * 0.3;
    let actual = secs + rand::thread_rng().gen_range(-spread..spread);
    duration_secs(actual.max(0.01))
}

/// Cancellation flag shared between an instance's run loop and its controller.
///
/// Every blocking wait inside an action goes through [`StopSignal::sleep`], so
/// `stop()` interrupts it instead of waiting out the full duration.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let (flag, cvar) = &*self.inner;
        *lock(flag) = true;
        cvar.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.inner.0) = false;
    }

    pub fn is_raised(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Sleep for `d` unless the signal is raised first. Returns false when interrupted.
    pub fn sleep(&self, d: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + d.min(MAX_WAIT);
        let mut raised = lock(flag);
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            raised = match cvar.wait_timeout(raised, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        false
    }

    pub fn sleep_secs(&self, secs: f64) -> bool {
        if secs <= 0.0 {
            return !self.is_raised();
        }
        self.sleep(duration_secs(secs))
    }
}
