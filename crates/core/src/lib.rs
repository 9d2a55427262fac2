//! Core of tapfarm: per-device automation instances driven by a game's
//! automation graph, supervised by a timeout watchdog and an orchestrator.

pub mod action;
pub mod controller;
pub mod cursor;
pub mod detect;
pub mod error;
pub mod executor;
pub mod game;
pub mod graph;
pub mod instance;
pub mod logger;
pub mod lua_rt;
pub mod macros;
pub mod orchestrator;
pub mod platform;
pub mod recovery;
pub mod settings;
pub mod sink;
pub mod sleep;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// A panic inside one instance's run loop must not take the status feed or
/// its siblings down with it.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
