//! Runs one action against one device.
//!
//! Every wait goes through the instance's [`StopSignal`] so `stop()` cuts it
//! short, and the device lock is taken per call, never across a sleep.

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::action::*;
use crate::cursor::Effects;
use crate::detect::{find, Detector};
use crate::error::{ActionError, DeviceError};
use crate::game::Game;
use crate::lock;
use crate::macros::MacroPlayer;
use crate::platform::DeviceChannel;
use crate::sleep::{duration_secs, StopSignal};
use crate::types::{Frame, Point};

const POLL_INTERVAL: f64 = 0.5;
const DEFAULT_WAIT_TIMEOUT: f64 = 60.0;

pub struct ActionRunner<'a> {
    pub device_id: &'a str,
    pub device: &'a Mutex<Box<dyn DeviceChannel>>,
    pub game: &'a dyn Game,
    pub detector: &'a dyn Detector,
    pub macros: &'a dyn MacroPlayer,
    pub stop: &'a StopSignal,
    pub speed: f64,
}

/// Template misses are expected outcomes for conditions, not errors.
fn is_miss(e: &ActionError) -> bool {
    matches!(e, ActionError::TemplateNotFound(_) | ActionError::LowConfidence { .. })
}

impl<'a> ActionRunner<'a> {
    pub fn run(&self, action: &Action) -> Result<Effects, ActionError> {
        self.run_on(action, None)
    }

    /// Run with an optional pre-captured frame reused for every detection.
    fn run_on(&self, action: &Action, frame: Option<&Frame>) -> Result<Effects, ActionError> {
        if self.stop.is_raised() {
            return Err(ActionError::Cancelled);
        }
        debug!(instance = %self.device_id, "{}", action);
        match action {
            Action::Macro(m) => self.play_macro(m),
            Action::Tap(t) => self.tap(t, frame),
            Action::Typing(t) => self.typing(t, frame),
            Action::Wait(w) => self.wait(w),
            Action::Swipe(s) => self.swipe(s, frame),
            Action::Screenshot(s) => self.screenshot(s),
            Action::Restart(r) => self.restart(r),
            Action::Counter(c) => self.counter(c),
            Action::Conditional(c) => self.conditional(c, frame),
            Action::Loop(l) => self.run_loop(l),
        }
    }

    fn pause(&self, secs: f64) -> Result<(), ActionError> {
        if self.stop.sleep_secs(secs) {
            Ok(())
        } else {
            Err(ActionError::Cancelled)
        }
    }

    fn with_device<R>(
        &self,
        f: impl FnOnce(&mut dyn DeviceChannel) -> Result<R, DeviceError>,
    ) -> Result<R, ActionError> {
        let mut device = lock(self.device);
        Ok(f(device.as_mut())?)
    }

    pub fn capture(&self) -> Result<Frame, ActionError> {
        self.with_device(|d| d.capture_frame())
    }

    fn threshold(&self, template: &str, likelihood: Option<f64>) -> f64 {
        likelihood.unwrap_or_else(|| self.game.template_threshold(template))
    }

    /// Find `template` on `frame`, capturing a fresh one when none is given.
    fn locate(&self, frame: Option<&Frame>, template: &str, likelihood: Option<f64>) -> Result<Point, ActionError> {
        let threshold = self.threshold(template, likelihood);
        let detection = match frame {
            Some(f) => find(self.detector, f, template, threshold)?,
            None => find(self.detector, &self.capture()?, template, threshold)?,
        };
        Ok(detection.at)
    }

    fn seen(&self, frame: Option<&Frame>, template: &str, likelihood: Option<f64>) -> Result<bool, ActionError> {
        match self.locate(frame, template, likelihood) {
            Ok(_) => Ok(true),
            Err(e) if is_miss(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn play_macro(&self, m: &Macro) -> Result<Effects, ActionError> {
        let speed = m.speed_multiplier.unwrap_or(self.speed);
        self.macros.play(self.device_id, &m.name, speed, self.stop)?;
        Ok(Effects::default())
    }

    fn tap(&self, t: &Tap, frame: Option<&Frame>) -> Result<Effects, ActionError> {
        self.pause(t.delay_before)?;

        let at = match t.coordinates {
            Some((x, y)) => Point::new(x, y),
            None => match t.timeout {
                None => self.locate(frame, &t.template, t.likelihood)?,
                Some(timeout) => match self.locate_until(&t.template, t.likelihood, timeout)? {
                    Some(at) => at,
                    None => {
                        warn!(instance = %self.device_id, "tap '{}' not found within {:.1}s, skipping", t.template, timeout);
                        self.pause(t.delay_after)?;
                        return Ok(Effects::default());
                    }
                },
            },
        };
        let at = at.offset(t.offset_x, t.offset_y);

        for i in 0..t.tap_times {
            if i > 0 {
                self.pause(t.tap_delay)?;
            }
            self.with_device(|d| d.tap(at))?;
        }

        self.pause(t.delay_after)?;
        Ok(Effects::default())
    }

    /// Poll for `template` until it shows up or `timeout` seconds pass.
    fn locate_until(&self, template: &str, likelihood: Option<f64>, timeout: f64) -> Result<Option<Point>, ActionError> {
        let deadline = Instant::now() + duration_secs(timeout);
        loop {
            match self.locate(None, template, likelihood) {
                Ok(at) => return Ok(Some(at)),
                Err(e) if is_miss(&e) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.pause(POLL_INTERVAL)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn typing(&self, t: &Typing, frame: Option<&Frame>) -> Result<Effects, ActionError> {
        self.pause(t.delay_before)?;

        if let Some(template) = &t.template {
            let at = self.locate(frame, template, None)?;
            self.with_device(|d| d.tap(at))?;
            self.pause(0.3)?;
        }

        if t.clear_first {
            for (key, settle) in [("KEYCODE_CTRL_LEFT", 0.1), ("KEYCODE_A", 0.1), ("KEYCODE_DEL", 0.2)] {
                self.with_device(|d| d.press_key(key))?;
                self.pause(settle)?;
            }
        }

        self.with_device(|d| d.type_text(&t.text))?;

        if t.press_enter {
            self.pause(0.2)?;
            self.with_device(|d| d.press_key("KEYCODE_ENTER"))?;
        }

        self.pause(t.delay_after)?;
        Ok(Effects::default())
    }

    fn wait(&self, w: &Wait) -> Result<Effects, ActionError> {
        let Some(condition) = &w.condition else {
            self.pause(w.duration)?;
            return Ok(Effects::default());
        };

        let timeout = w.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let deadline = Instant::now() + duration_secs(timeout);
        loop {
            if self.seen(None, condition, w.likelihood)? {
                return Ok(Effects::default());
            }
            if Instant::now() >= deadline {
                return Err(ActionError::WaitTimedOut { template: condition.clone(), seconds: timeout });
            }
            self.pause(POLL_INTERVAL)?;
        }
    }

    fn resolve(&self, target: &Target, frame: Option<&Frame>) -> Result<Point, ActionError> {
        match target {
            Target::At((x, y)) => Ok(Point::new(*x, *y)),
            Target::Template { template, likelihood } => self.locate(frame, template, *likelihood),
        }
    }

    fn swipe(&self, s: &Swipe, frame: Option<&Frame>) -> Result<Effects, ActionError> {
        self.pause(s.delay_before)?;
        let needs_frame = matches!(s.start, Target::Template { .. }) || matches!(s.end, Target::Template { .. });
        let captured;
        let frame = match frame {
            Some(f) => Some(f),
            None if needs_frame => {
                captured = self.capture()?;
                Some(&captured)
            }
            None => None,
        };
        let from = self.resolve(&s.start, frame)?;
        let to = self.resolve(&s.end, frame)?;
        self.with_device(|d| d.swipe(from, to, s.duration_ms))?;
        self.pause(s.delay_after)?;
        Ok(Effects::default())
    }

    fn screenshot(&self, s: &Screenshot) -> Result<Effects, ActionError> {
        let frame = self.capture()?;
        if let Some(path) = &s.save_path {
            let path = path.replace("{device}", &self.device_id.replace(':', "_"));
            save_frame(Path::new(&path), &frame).map_err(DeviceError::from)?;
            debug!(instance = %self.device_id, "saved frame to {}", path);
        }
        let mut effects = Effects::default();
        if s.process_items {
            effects.items = self
                .game
                .process_items(&frame, self.device_id)
                .map_err(|e| ActionError::Game(e.to_string()))?;
        }
        Ok(effects)
    }

    fn restart(&self, r: &Restart) -> Result<Effects, ActionError> {
        self.pause(r.delay_before)?;
        info!(instance = %self.device_id, "restarting {}", self.game.app().package);
        let timeout = duration_secs(r.timeout);
        self.with_device(|d| d.restart_app(self.game.app(), timeout))?;
        self.pause(r.delay_after)?;
        Ok(Effects::default())
    }

    fn counter(&self, c: &Counter) -> Result<Effects, ActionError> {
        self.pause(c.delay_before)?;
        self.pause(c.delay_after)?;
        Ok(Effects { counter: 1, ..Effects::default() })
    }

    fn conditional(&self, c: &Conditional, frame: Option<&Frame>) -> Result<Effects, ActionError> {
        let met = self.seen(frame, &c.condition, c.likelihood)?;
        debug!(instance = %self.device_id, "condition '{}' {}", c.condition, if met { "met" } else { "not met" });

        let (actions, jump) = if met {
            (&c.if_true, &c.if_true_state)
        } else {
            (&c.if_false, &c.if_false_state)
        };

        let mut effects = Effects::default();
        for action in actions {
            effects.merge(self.run_on(action, frame)?);
        }
        if let Some(state) = jump {
            effects.jump = Some(state.clone());
        }
        Ok(effects)
    }

    fn run_loop(&self, l: &Loop) -> Result<Effects, ActionError> {
        let started = Instant::now();
        let timed_out = || l.timeout.is_some_and(|t| started.elapsed().as_secs_f64() > t);
        let mut effects = Effects::default();
        let mut iteration = 0u32;

        loop {
            if l.max_iterations.is_some_and(|max| iteration >= max) || timed_out() {
                break;
            }

            let frame = if l.single_frame { Some(self.capture()?) } else { None };

            if let Some(condition) = &l.condition {
                if self.seen(frame.as_ref(), condition, l.condition_likelihood)? {
                    debug!(instance = %self.device_id, "loop exit condition '{}' met", condition);
                    break;
                }
            }

            for action in &l.actions {
                if timed_out() {
                    break;
                }
                effects.merge(self.run_on(action, frame.as_ref())?);
            }
            iteration += 1;
        }

        debug!(instance = %self.device_id, "loop done after {} iterations", iteration);
        Ok(effects)
    }
}

fn save_frame(path: &Path, frame: &Frame) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, &frame.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StateDefinition;
    use crate::testing::{DeviceProbe, FixedGame, NoopMacroPlayer, ScriptedDetector, ScriptedDevice};

    struct Bench {
        device: Mutex<Box<dyn DeviceChannel>>,
        probe: DeviceProbe,
        game: FixedGame,
        detector: ScriptedDetector,
        stop: StopSignal,
    }

    impl Bench {
        fn new() -> Self {
            let (device, probe) = ScriptedDevice::new("emulator-5554");
            Self {
                device: Mutex::new(device),
                probe,
                game: FixedGame::new("a", vec![StateDefinition::new("a").with_next(&["a"])]).with_items(&["gold"]),
                detector: ScriptedDetector::new(),
                stop: StopSignal::new(),
            }
        }

        fn runner(&self) -> ActionRunner<'_> {
            ActionRunner {
                device_id: "emulator-5554",
                device: &self.device,
                game: &self.game,
                detector: &self.detector,
                macros: &NoopMacroPlayer,
                stop: &self.stop,
                speed: 1.0,
            }
        }
    }

    fn parse(json: &str) -> Action {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_tap_applies_offset_and_repeats() {
        let b = Bench::new();
        let action = parse(r#"{"type":"tap","template":"ok","offset_x":5,"offset_y":-10,"tap_times":2,"tap_delay":0}"#);
        b.runner().run(&action).unwrap();
        assert_eq!(b.probe.calls(), vec!["capture", "tap 105 190", "tap 105 190"]);
    }

    #[test]
    fn test_tap_without_timeout_fails_on_miss() {
        let b = Bench::new();
        b.detector.set_missing("ok");
        let err = b.runner().run(&Action::tap("ok")).unwrap_err();
        assert!(matches!(err, ActionError::TemplateNotFound(t) if t == "ok"));
        assert_eq!(b.probe.taps(), 0);
    }

    #[test]
    fn test_tap_with_timeout_skips_on_miss() {
        let b = Bench::new();
        b.detector.set_missing("ok");
        let action = parse(r#"{"type":"tap","template":"ok","timeout":0}"#);
        let effects = b.runner().run(&action).unwrap();
        assert_eq!(effects, Effects::default());
        assert_eq!(b.probe.taps(), 0);
    }

    #[test]
    fn test_tap_at_coordinates_skips_detection() {
        let b = Bench::new();
        let action = parse(r#"{"type":"tap","coordinates":[7,8]}"#);
        b.runner().run(&action).unwrap();
        assert_eq!(b.probe.calls(), vec!["tap 7 8"]);
    }

    #[test]
    fn test_typing_clears_then_enters() {
        let b = Bench::new();
        let action = parse(r#"{"type":"typing","text":"hello","clear_first":true,"press_enter":true}"#);
        b.runner().run(&action).unwrap();
        assert_eq!(
            b.probe.calls(),
            vec!["key KEYCODE_CTRL_LEFT", "key KEYCODE_A", "key KEYCODE_DEL", "text hello", "key KEYCODE_ENTER"]
        );
    }

    #[test]
    fn test_wait_for_condition_times_out() {
        let b = Bench::new();
        b.detector.set_missing("loading_done");
        let action = parse(r#"{"type":"wait","condition":"loading_done","timeout":0}"#);
        let err = b.runner().run(&action).unwrap_err();
        assert!(matches!(err, ActionError::WaitTimedOut { ref template, .. } if template == "loading_done"));
    }

    #[test]
    fn test_wait_for_condition_returns_when_seen() {
        let b = Bench::new();
        let action = parse(r#"{"type":"wait","condition":"loading_done","timeout":5}"#);
        assert!(b.runner().run(&action).is_ok());
        assert_eq!(b.detector.calls("loading_done"), 1);
    }

    #[test]
    fn test_conditional_picks_branch_and_jump() {
        let b = Bench::new();
        b.detector.script("banner", [false]);
        let action = parse(
            r#"{"type":"conditional","condition":"banner",
                "if_true":[{"type":"tap","template":"close"}],
                "if_false":[{"type":"counter"}],
                "if_false_state":"home"}"#,
        );
        let effects = b.runner().run(&action).unwrap();
        assert_eq!(effects.counter, 1);
        assert_eq!(effects.jump.as_deref(), Some("home"));
        assert_eq!(b.probe.taps(), 0);
    }

    #[test]
    fn test_loop_stops_at_max_iterations() {
        let b = Bench::new();
        let action = parse(r#"{"type":"loop","max_iterations":3,"actions":[{"type":"counter"}]}"#);
        let effects = b.runner().run(&action).unwrap();
        assert_eq!(effects.counter, 3);
    }

    #[test]
    fn test_loop_exits_on_condition() {
        let b = Bench::new();
        b.detector.script("done", [false, false, true]);
        let action = parse(
            r#"{"type":"loop","condition":"done","max_iterations":10,"single_frame":true,
                "actions":[{"type":"tap","template":"next","tap_delay":0}]}"#,
        );
        b.runner().run(&action).unwrap();
        assert_eq!(b.probe.taps(), 2);
        // one frame per iteration, shared by the condition and the tap
        assert_eq!(b.probe.calls().iter().filter(|c| *c == "capture").count(), 3);
    }

    #[test]
    fn test_screenshot_collects_items_and_saves_frame() {
        let b = Bench::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shots/{device}.png");
        let action = Action::Screenshot(Screenshot {
            save_path: Some(path.to_string_lossy().into_owned()),
            process_items: true,
        });
        let effects = b.runner().run(&action).unwrap();
        assert_eq!(effects.items, vec!["gold"]);
        assert!(dir.path().join("shots/emulator-5554.png").is_file());
    }

    #[test]
    fn test_raised_stop_cancels_before_running() {
        let b = Bench::new();
        b.stop.raise();
        assert!(matches!(b.runner().run(&Action::counter()), Err(ActionError::Cancelled)));
        assert!(b.probe.calls().is_empty());
    }

    #[test]
    fn test_device_failure_propagates() {
        let b = Bench::new();
        b.probe.set_disconnected(true);
        let err = b.runner().run(&Action::tap("ok")).unwrap_err();
        assert!(err.is_channel_loss());
    }
}
