//! In-memory collaborators for driving instances deterministically in tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::controller::{InstanceController, Runtime};
use crate::detect::Detector;
use crate::error::{ActionError, DeviceError, Error, Result};
use crate::game::{BranchContext, Game, ScoreTable};
use crate::graph::{AutomationGraph, StateDefinition};
use crate::lock;
use crate::macros::MacroPlayer;
use crate::platform::DeviceChannel;
use crate::settings::RunConfig;
use crate::sink::{Notification, Notifier, OrchestratorSnapshot, StatusSink};
use crate::sleep::{Clock, StopSignal};
use crate::types::*;

/// Run config with every wait set to zero.
pub fn fast_config() -> RunConfig {
    RunConfig {
        speed: 1.0,
        tick_interval: 0.0,
        watchdog_interval: Duration::from_millis(10),
        status_interval: Duration::from_millis(20),
        item_settle: 0.0,
        session_cooldown: 0.0,
        ..RunConfig::default()
    }
}

/// What a [`ScriptedDevice`] saw, plus failure switches. Shared with the test.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub calls: Vec<String>,
    pub fail_taps: bool,
    pub disconnected: bool,
    /// Number of upcoming restart_app calls that fail
    pub failing_restarts: u32,
    pub restarts: u32,
}

#[derive(Clone, Default)]
pub struct DeviceProbe(Arc<Mutex<DeviceLog>>);

impl DeviceProbe {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.0).calls.clone()
    }

    pub fn taps(&self) -> usize {
        lock(&self.0).calls.iter().filter(|c| c.starts_with("tap")).count()
    }

    pub fn restarts(&self) -> u32 {
        lock(&self.0).restarts
    }

    pub fn set_fail_taps(&self, fail: bool) {
        lock(&self.0).fail_taps = fail;
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        lock(&self.0).disconnected = disconnected;
    }

    pub fn fail_next_restarts(&self, n: u32) {
        lock(&self.0).failing_restarts = n;
    }
}

pub struct ScriptedDevice {
    id: String,
    log: DeviceProbe,
}

impl ScriptedDevice {
    pub fn new(id: &str) -> (Box<dyn DeviceChannel>, DeviceProbe) {
        let probe = DeviceProbe::default();
        (Box::new(Self { id: id.to_string(), log: probe.clone() }), probe)
    }

    fn record(&self, call: String) -> std::result::Result<(), DeviceError> {
        let mut log = lock(&self.log.0);
        if log.disconnected {
            return Err(DeviceError::Disconnected(self.id.clone()));
        }
        log.calls.push(call);
        Ok(())
    }
}

impl DeviceChannel for ScriptedDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn tap(&mut self, at: Point) -> std::result::Result<(), DeviceError> {
        if lock(&self.log.0).fail_taps {
            return Err(DeviceError::CommandFailed { command: "tap".into(), message: "injected".into() });
        }
        self.record(format!("tap {} {}", at.x, at.y))
    }

    fn swipe(&mut self, from: Point, to: Point, duration_ms: u64) -> std::result::Result<(), DeviceError> {
        self.record(format!("swipe {} {} {} {} {}", from.x, from.y, to.x, to.y, duration_ms))
    }

    fn type_text(&mut self, text: &str) -> std::result::Result<(), DeviceError> {
        self.record(format!("text {}", text))
    }

    fn press_key(&mut self, code: &str) -> std::result::Result<(), DeviceError> {
        self.record(format!("key {}", code))
    }

    fn restart_app(&mut self, app: &AppTarget, _timeout: Duration) -> std::result::Result<(), DeviceError> {
        {
            let mut log = lock(&self.log.0);
            if log.failing_restarts > 0 {
                log.failing_restarts -= 1;
                return Err(DeviceError::CommandFailed { command: "am start".into(), message: "injected".into() });
            }
            log.restarts += 1;
        }
        self.record(format!("restart {}", app.package))
    }

    fn capture_frame(&mut self) -> std::result::Result<Frame, DeviceError> {
        self.record("capture".into())?;
        Ok(Frame { data: Vec::new(), width: 540, height: 960 })
    }
}

/// Detector answering from per-template scripts. Unscripted templates are
/// found at (100, 200) unless marked missing.
#[derive(Default)]
pub struct ScriptedDetector {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    missing: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for `template`; once drained the default applies again.
    pub fn script(&self, template: &str, results: impl IntoIterator<Item = bool>) {
        lock(&self.scripts).entry(template.to_string()).or_default().extend(results);
    }

    pub fn set_missing(&self, template: &str) {
        lock(&self.missing).push(template.to_string());
    }

    pub fn calls(&self, template: &str) -> usize {
        lock(&self.calls).get(template).copied().unwrap_or(0)
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, _frame: &Frame, template: &str, _threshold: f64) -> std::result::Result<Option<Detection>, ActionError> {
        *lock(&self.calls).entry(template.to_string()).or_default() += 1;
        let scripted = lock(&self.scripts).get_mut(template).and_then(|q| q.pop_front());
        let found = scripted.unwrap_or_else(|| !lock(&self.missing).iter().any(|t| t == template));
        Ok(found.then_some(Detection { at: Point::new(100, 200), confidence: 0.95 }))
    }
}

pub struct NoopMacroPlayer;

impl MacroPlayer for NoopMacroPlayer {
    fn play(&self, _device: &str, _name: &str, _speed: f64, _stop: &StopSignal) -> std::result::Result<(), ActionError> {
        Ok(())
    }
}

type BranchFn = Box<dyn Fn(&BranchContext) -> Result<String> + Send + Sync>;

/// Game with a fixed graph and pluggable branching.
pub struct FixedGame {
    app: AppTarget,
    graph: Arc<AutomationGraph>,
    branch: BranchFn,
    items: Vec<String>,
    new_cycle: bool,
    notify_threshold: Option<u64>,
    scores: ScoreTable,
}

impl FixedGame {
    pub fn new(entry: &str, states: Vec<StateDefinition>) -> Self {
        let graph = AutomationGraph::new(entry, states).unwrap_or_else(|e| panic!("test graph: {}", e));
        Self {
            app: AppTarget { package: "com.example.game".into(), activity: "com.example.game/.Main".into() },
            graph: Arc::new(graph),
            branch: Box::new(|ctx| {
                ctx.candidates.first().cloned().ok_or_else(|| Error::Branch {
                    state: ctx.state.clone(),
                    message: "no candidates".into(),
                })
            }),
            items: Vec::new(),
            new_cycle: true,
            notify_threshold: None,
            scores: ScoreTable::default(),
        }
    }

    pub fn with_branch(mut self, f: impl Fn(&BranchContext) -> Result<String> + Send + Sync + 'static) -> Self {
        self.branch = Box::new(f);
        self
    }

    pub fn with_items(mut self, items: &[&str]) -> Self {
        self.items = items.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_new_cycle(mut self, new_cycle: bool) -> Self {
        self.new_cycle = new_cycle;
        self
    }

    pub fn with_notify_threshold(mut self, threshold: u64) -> Self {
        self.notify_threshold = Some(threshold);
        self
    }

    pub fn with_scores(mut self, scores: ScoreTable) -> Self {
        self.scores = scores;
        self
    }
}

impl Game for FixedGame {
    fn name(&self) -> &str {
        "fixed"
    }

    fn app(&self) -> &AppTarget {
        &self.app
    }

    fn graph(&self) -> Arc<AutomationGraph> {
        Arc::clone(&self.graph)
    }

    fn for_instance(self: Arc<Self>, _device: &str) -> Result<Arc<dyn Game>> {
        Ok(self)
    }

    fn notify_threshold(&self) -> Option<u64> {
        self.notify_threshold
    }

    fn resolve_branch(&self, ctx: &BranchContext) -> Result<String> {
        (self.branch)(ctx)
    }

    fn is_new_cycle(&self, _frame: &Frame, _device: &str) -> Result<bool> {
        Ok(self.new_cycle)
    }

    fn process_items(&self, _frame: &Frame, _device: &str) -> Result<Vec<String>> {
        Ok(self.items.clone())
    }

    fn score(&self, items: &[String]) -> crate::game::ScoreReport {
        self.scores.score(items)
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self { now: Mutex::new(Instant::now()) }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        *lock(&self.now) += d;
    }

    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::from_secs_f64(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        lock(&self.events).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        lock(&self.events).push(notification);
    }
}

#[derive(Default)]
pub struct RecordingSink {
    snapshots: Mutex<Vec<OrchestratorSnapshot>>,
}

impl RecordingSink {
    pub fn snapshots(&self) -> Vec<OrchestratorSnapshot> {
        lock(&self.snapshots).clone()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, snapshot: &OrchestratorSnapshot) {
        lock(&self.snapshots).push(snapshot.clone());
    }
}

/// Wires a game to scripted collaborators and a manual clock.
pub struct Harness {
    pub runtime: Arc<Runtime>,
    pub clock: Arc<ManualClock>,
    pub detector: Arc<ScriptedDetector>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(game: FixedGame) -> Self {
        Self::with_config(game, fast_config())
    }

    pub fn with_config(game: FixedGame, config: RunConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let detector = Arc::new(ScriptedDetector::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let runtime = Runtime::new(
            Arc::new(game),
            detector.clone(),
            Arc::new(NoopMacroPlayer),
            notifier.clone(),
            config,
        )
        .with_clock(clock.clone());
        Self { runtime: Arc::new(runtime), clock, detector, notifier }
    }

    /// A controller on a fresh scripted device, already marked running.
    pub fn running(&self, number: usize, device: &str) -> (Arc<InstanceController>, DeviceProbe) {
        let (channel, probe) = ScriptedDevice::new(device);
        let c = InstanceController::new(number, channel, Arc::clone(&self.runtime))
            .unwrap_or_else(|e| panic!("test instance: {}", e));
        c.set_running();
        (c, probe)
    }
}
