//! Run loop for one instance bound to one device.
//!
//! The instance lock is held only to read or write instance fields, never
//! across an action, a detection or a sleep. Results of an action that raced
//! with a recovery are recognized by their stale generation and dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::cursor::ActionResult;
use crate::detect::{find, Detector};
use crate::error::{ActionError, Error, Result};
use crate::executor::ActionRunner;
use crate::game::{BranchContext, Game};
use crate::graph::{AutomationGraph, StateDefinition};
use crate::instance::{Instance, InstanceSnapshot};
use crate::lock;
use crate::macros::MacroPlayer;
use crate::platform::DeviceChannel;
use crate::settings::RunConfig;
use crate::sink::{Notification, Notifier};
use crate::sleep::{jitter, Clock, StopSignal, SystemClock};
use crate::types::{DeviceId, Frame, InstanceStatus};

/// Collaborators shared by every instance of one run.
pub struct Runtime {
    /// Game as loaded. Instances call hooks through their own handle from
    /// [`Game::for_instance`].
    pub game: Arc<dyn Game>,
    pub graph: Arc<AutomationGraph>,
    pub detector: Arc<dyn Detector>,
    pub macros: Arc<dyn MacroPlayer>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub config: RunConfig,
}

impl Runtime {
    pub fn new(
        game: Arc<dyn Game>,
        detector: Arc<dyn Detector>,
        macros: Arc<dyn MacroPlayer>,
        notifier: Arc<dyn Notifier>,
        config: RunConfig,
    ) -> Self {
        Self {
            graph: game.graph(),
            game,
            detector,
            macros,
            notifier,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cycles_per_session(&self) -> u32 {
        self.config.cycles.unwrap_or_else(|| self.game.cycles_per_session())
    }
}

/// Outcome of one scheduling tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Not running (paused, stopped or restarting)
    Idle,
    /// Required templates not on screen yet
    NotReady,
    Advanced,
    Failed,
    Transitioned(String),
    Halted,
}

pub struct InstanceController {
    device_id: DeviceId,
    instance: Mutex<Instance>,
    device: Mutex<Box<dyn DeviceChannel>>,
    /// This instance's own game handle (own interpreter for scripted games)
    game: Arc<dyn Game>,
    runtime: Arc<Runtime>,
    stop: StopSignal,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InstanceController {
    pub fn new(number: usize, device: Box<dyn DeviceChannel>, runtime: Arc<Runtime>) -> Result<Arc<Self>> {
        let device_id = device.id().to_string();
        let game = Arc::clone(&runtime.game).for_instance(&device_id)?;
        let instance = Instance::new(number, device_id.clone(), runtime.graph.entry(), runtime.clock.now());
        Ok(Arc::new(Self {
            device_id,
            instance: Mutex::new(instance),
            device: Mutex::new(device),
            game,
            runtime,
            stop: StopSignal::new(),
            worker: Mutex::new(None),
        }))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn instance(&self) -> MutexGuard<'_, Instance> {
        lock(&self.instance)
    }

    pub(crate) fn device(&self) -> &Mutex<Box<dyn DeviceChannel>> {
        &self.device
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance().status
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let now = self.runtime.clock.now();
        let inst = self.instance();
        let actions = self.runtime.graph.get(&inst.state).map_or(0, |s| s.actions.len());
        inst.snapshot(now, actions)
    }

    /// Mark a stopped instance running without spawning its loop. [`start`]
    /// builds on this; callers may also drive [`tick`] themselves.
    ///
    /// [`start`]: InstanceController::start
    /// [`tick`]: InstanceController::tick
    pub fn set_running(&self) -> bool {
        let now = self.runtime.clock.now();
        let mut inst = self.instance();
        if inst.status != InstanceStatus::Stopped {
            return false;
        }
        inst.halt_reason = None;
        inst.clock.resume(now);
        if self.runtime.config.restart_on_start {
            inst.restart_pending = true;
            inst.status = InstanceStatus::Restarting;
        } else {
            inst.status = InstanceStatus::Running;
        }
        self.stop.clear();
        info!(instance = %self.device_id, "started in '{}'", inst.state);
        true
    }

    /// Set the instance running and spawn its run loop if none is alive.
    pub fn start(self: &Arc<Self>) {
        let mut worker = lock(&self.worker);
        if !self.set_running() {
            return;
        }
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let me = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("instance-{}", self.device_id))
            .spawn(move || me.run_loop());
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(e) => {
                error!(instance = %self.device_id, "failed to spawn run loop: {}", e);
                self.halt(format!("failed to spawn run loop: {}", e));
            }
        }
    }

    /// Halt scheduling. An in-flight action is interrupted at its next wait;
    /// the cursor keeps pointing at the last attempted action.
    pub fn stop(&self) {
        self.stop.raise();
        let now = self.runtime.clock.now();
        let mut inst = self.instance();
        if inst.status != InstanceStatus::Stopped {
            inst.status = InstanceStatus::Stopped;
            inst.clock.pause(now);
            info!(instance = %self.device_id, "stopped in '{}' at action {}", inst.state, inst.cursor.position());
        }
    }

    pub fn pause(&self) {
        let now = self.runtime.clock.now();
        let mut inst = self.instance();
        if matches!(inst.status, InstanceStatus::Running | InstanceStatus::Restarting) {
            inst.status = InstanceStatus::Paused;
            inst.clock.pause(now);
            info!(instance = %self.device_id, "paused");
        }
    }

    pub fn resume(&self) {
        let now = self.runtime.clock.now();
        let mut inst = self.instance();
        if inst.status == InstanceStatus::Paused {
            inst.status = if inst.restart_pending { InstanceStatus::Restarting } else { InstanceStatus::Running };
            inst.clock.resume(now);
            info!(instance = %self.device_id, "resumed");
        }
    }

    /// Ask the supervisor for a recovery on its next pass.
    pub fn request_restart(&self) {
        let mut inst = self.instance();
        if inst.status == InstanceStatus::Stopped {
            warn!(instance = %self.device_id, "not restarting a stopped instance");
            return;
        }
        inst.restart_pending = true;
        if inst.status == InstanceStatus::Running {
            inst.status = InstanceStatus::Restarting;
        }
        info!(instance = %self.device_id, "restart requested");
    }

    /// Wait for the run loop thread to exit. Call after `stop()`.
    pub fn join(&self) {
        let handle = lock(&self.worker).take();
        if let Some(h) = handle {
            h.join().ok();
        }
    }

    fn run_loop(self: Arc<Self>) {
        debug!(instance = %self.device_id, "run loop started");
        let interval = self.runtime.config.tick_interval;
        while !self.stop.is_raised() {
            match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Tick::Halted) => break,
                Ok(_) => {}
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".into());
                    self.halt(format!("crashed: {}", message));
                    break;
                }
            }
            if !self.stop.sleep(jitter(interval)) {
                break;
            }
        }
        debug!(instance = %self.device_id, "run loop exited");
    }

    fn runner(&self) -> ActionRunner<'_> {
        ActionRunner {
            device_id: &self.device_id,
            device: &self.device,
            game: self.game.as_ref(),
            detector: self.runtime.detector.as_ref(),
            macros: self.runtime.macros.as_ref(),
            stop: &self.stop,
            speed: self.runtime.config.speed,
        }
    }

    /// Stop the instance for good and record why.
    fn halt(&self, reason: String) {
        self.stop.raise();
        let now = self.runtime.clock.now();
        self.instance().halt(reason.clone(), now);
        error!(instance = %self.device_id, "halted: {}", reason);
        self.runtime.notifier.notify(Notification::InstanceHalted { device: self.device_id.clone(), reason });
    }

    /// One scheduling step: readiness check, one action, or a transition.
    pub fn tick(&self) -> Tick {
        let (state_name, cursor, generation, ready) = {
            let inst = self.instance();
            if inst.status != InstanceStatus::Running {
                return Tick::Idle;
            }
            (inst.state.clone(), inst.cursor, inst.generation, inst.ready)
        };

        let state = match self.runtime.graph.state(&state_name) {
            Ok(s) => s,
            Err(e) => {
                self.halt(e.to_string());
                return Tick::Halted;
            }
        };

        if !ready {
            if !self.check_ready(state) {
                return Tick::NotReady;
            }
            let mut inst = self.instance();
            if inst.generation != generation {
                return Tick::Idle;
            }
            inst.ready = true;
        }

        let result = match cursor.current(state) {
            None => ActionResult::Exhausted,
            Some(action) => match self.runner().run(action) {
                Ok(effects) => ActionResult::Completed(effects),
                Err(e) => ActionResult::Failed(e),
            },
        };
        match result {
            ActionResult::Exhausted => self.finish_state(state, generation),
            result => self.commit(state, generation, result),
        }
    }

    /// Every required template must be on the current frame.
    fn check_ready(&self, state: &StateDefinition) -> bool {
        if state.required_templates.is_empty() {
            return true;
        }
        let frame = match self.runner().capture() {
            Ok(f) => f,
            Err(e) => {
                debug!(instance = %self.device_id, "readiness capture failed: {}", e);
                return false;
            }
        };
        for template in &state.required_templates {
            let threshold = self.game.template_threshold(template);
            if let Err(e) = find(self.runtime.detector.as_ref(), &frame, template, threshold) {
                debug!(instance = %self.device_id, "'{}' not ready: {}", state.name, e);
                return false;
            }
        }
        debug!(instance = %self.device_id, "'{}' ready", state.name);
        true
    }

    fn commit(&self, state: &StateDefinition, generation: u64, result: ActionResult) -> Tick {
        let error = match result {
            ActionResult::Failed(ActionError::Cancelled) => return Tick::Idle,
            ActionResult::Failed(e) => e,
            completed => {
                let (effects, items) = {
                    let mut inst = self.instance();
                    if inst.generation != generation {
                        debug!(instance = %self.device_id, "dropping result from before recovery");
                        return Tick::Idle;
                    }
                    let Some(effects) = inst.cursor.commit(state, completed) else {
                        return Tick::Idle;
                    };
                    inst.apply(&effects);
                    inst.consecutive_failures = 0;
                    inst.last_error = None;
                    let items = (!effects.items.is_empty()).then(|| inst.items.clone());
                    (effects, items)
                };
                if let Some(items) = items {
                    self.rescore(&items, generation);
                }
                if let Some(target) = effects.jump {
                    return self.transition(state, &target, generation);
                }
                if state.processes_items {
                    self.process_items(generation);
                }
                return Tick::Advanced;
            }
        };

        if error.is_channel_loss() {
            warn!(instance = %self.device_id, "device channel lost: {}", error);
        } else {
            warn!(instance = %self.device_id, "'{}' action failed: {}", state.name, error);
        }
        let mut inst = self.instance();
        if inst.generation == generation {
            inst.record_failure(error.to_string());
        }
        Tick::Failed
    }

    /// After an action in an item state: let the screen settle, then read the
    /// cycle result off a fresh frame.
    fn process_items(&self, generation: u64) {
        let speed = self.runtime.config.speed;
        if !self.stop.sleep_secs(self.runtime.config.item_settle * speed) {
            return;
        }
        let frame = match self.runner().capture() {
            Ok(f) => f,
            Err(e) => {
                warn!(instance = %self.device_id, "item capture failed: {}", e);
                return;
            }
        };
        let game = &self.game;
        match game.is_new_cycle(&frame, &self.device_id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(instance = %self.device_id, "cycle check failed: {}", e);
                return;
            }
        }
        let items = game.process_items(&frame, &self.device_id).unwrap_or_else(|e| {
            warn!(instance = %self.device_id, "item detection failed: {}", e);
            Vec::new()
        });

        let (cycle, items) = {
            let mut inst = self.instance();
            if inst.generation != generation {
                return;
            }
            inst.cycle_index += 1;
            inst.items.extend(items);
            (inst.cycle_index, inst.items.clone())
        };
        if let Some(score) = self.rescore(&items, generation) {
            info!(
                instance = %self.device_id,
                "cycle {}/{}: {} items, score {}",
                cycle,
                self.runtime.cycles_per_session(),
                items.len(),
                score
            );
        }
    }

    /// Score `items` without holding the instance lock, then store the total
    /// unless a recovery happened meanwhile.
    fn rescore(&self, items: &[String], generation: u64) -> Option<u64> {
        let score = self.game.score(items).total;
        let mut inst = self.instance();
        if inst.generation != generation {
            return None;
        }
        inst.score = score;
        Some(score)
    }

    /// The state's actions are done: pick the successor, close the session
    /// if this state ends one, and move on.
    fn finish_state(&self, state: &StateDefinition, generation: u64) -> Tick {
        let next = match self.select_next(state) {
            Ok(next) => next,
            Err(e) if e.is_contract_violation() => {
                self.halt(e.to_string());
                return Tick::Halted;
            }
            Err(e) => {
                warn!(instance = %self.device_id, "could not choose next state from '{}': {}", state.name, e);
                return Tick::Failed;
            }
        };

        if state.completes_session {
            if !self.complete_session(generation) {
                return Tick::Idle;
            }
            // An interrupted cooldown still moves on, or the session would close twice.
            self.stop.sleep_secs(self.runtime.config.session_cooldown * self.runtime.config.speed);
        }

        self.transition(state, &next, generation)
    }

    fn select_next(&self, state: &StateDefinition) -> Result<String> {
        let next = match state.next_states.as_slice() {
            [] => return Err(Error::graph(format!("state '{}' has no next states", state.name))),
            [only] => only.clone(),
            candidates => {
                let frame = self.runner().capture().map_err(|e| match e {
                    ActionError::Device(d) => Error::Device(d),
                    other => Error::Branch { state: state.name.clone(), message: other.to_string() },
                })?;
                let ctx = self.branch_context(state, candidates, frame);
                self.game.resolve_branch(&ctx).map_err(|e| match e {
                    Error::Branch { .. } | Error::InvalidTransition { .. } => e,
                    other => Error::Branch { state: state.name.clone(), message: other.to_string() },
                })?
            }
        };
        if !state.allows(&next) {
            return Err(Error::InvalidTransition {
                state: state.name.clone(),
                target: next,
                allowed: state.next_states.clone(),
            });
        }
        Ok(next)
    }

    fn branch_context(&self, state: &StateDefinition, candidates: &[String], frame: Frame) -> BranchContext {
        let inst = self.instance();
        BranchContext {
            device: self.device_id.clone(),
            state: state.name.clone(),
            candidates: candidates.to_vec(),
            cycle_index: inst.cycle_index,
            cycles_per_session: self.runtime.cycles_per_session(),
            counter: inst.counter,
            score: inst.score,
            session_count: inst.session_count,
            frame,
        }
    }

    /// Score the session, notify, and reset per-session accounting.
    /// Returns false when a recovery got there first.
    fn complete_session(&self, generation: u64) -> bool {
        let game = &self.game;
        let items = {
            let inst = self.instance();
            if inst.generation != generation {
                return false;
            }
            inst.items.clone()
        };
        let report = game.score(&items);
        let (session, counter, cycles) = {
            let mut inst = self.instance();
            if inst.generation != generation {
                return false;
            }
            let done = (inst.session_count + 1, inst.counter, inst.cycle_index);
            inst.reset_session();
            done
        };

        info!(
            instance = %self.device_id,
            "session {} complete: score {}, {} cycles, counter {}",
            session, report.total, cycles, counter
        );
        let notifier = &self.runtime.notifier;
        notifier.notify(Notification::SessionCompleted {
            device: self.device_id.clone(),
            session,
            score: report.total,
            counter,
            cycles,
            items,
        });
        if let Some(threshold) = game.notify_threshold() {
            if report.total >= threshold {
                notifier.notify(Notification::HighScore {
                    device: self.device_id.clone(),
                    session,
                    score: report.total,
                    threshold,
                });
            }
        }
        true
    }

    fn transition(&self, from: &StateDefinition, to: &str, generation: u64) -> Tick {
        if !from.allows(to) {
            let e = Error::InvalidTransition {
                state: from.name.clone(),
                target: to.to_string(),
                allowed: from.next_states.clone(),
            };
            self.halt(e.to_string());
            return Tick::Halted;
        }
        let now = self.runtime.clock.now();
        let mut inst = self.instance();
        if inst.generation != generation {
            return Tick::Idle;
        }
        inst.enter_state(to, now);
        info!(instance = %self.device_id, "{} -> {}", from.name, to);
        Tick::Transitioned(to.to_string())
    }
}
