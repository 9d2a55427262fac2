//! Action definitions: one executable step inside a state.
//!
//! Actions are plain data. They deserialize from game scripts (through mlua's
//! serde support) or JSON with a `type` tag, e.g.
//! `{ type = "tap", template = "start", likelihood = 0.9 }`.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Error as _, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};

/// Lua has no distinct empty array: `{}` arrives as an empty map. Accept both.
pub(crate) fn lenient_seq<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seq<T> {
        List(Vec<T>),
        Map(BTreeMap<String, IgnoredAny>),
    }

    match Seq::<T>::deserialize(d)? {
        Seq::List(v) => Ok(v),
        Seq::Map(m) if m.is_empty() => Ok(Vec::new()),
        Seq::Map(_) => Err(D::Error::custom("expected a list")),
    }
}

fn one() -> u32 {
    1
}

fn default_tap_delay() -> f64 {
    0.1
}

fn default_swipe_ms() -> u64 {
    1000
}

fn default_restart_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Macro(Macro),
    Tap(Tap),
    Typing(Typing),
    Wait(Wait),
    Swipe(Swipe),
    Screenshot(Screenshot),
    Restart(Restart),
    Counter(Counter),
    Conditional(Conditional),
    Loop(Loop),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Macro {
    pub name: String,
    /// Overrides the run-wide speed multiplier for this playback
    #[serde(default)]
    pub speed_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tap {
    #[serde(default)]
    pub template: String,
    /// Fixed tap position; skips detection when present
    #[serde(default)]
    pub coordinates: Option<(i32, i32)>,
    #[serde(default)]
    pub offset_x: i32,
    #[serde(default)]
    pub offset_y: i32,
    #[serde(default = "one")]
    pub tap_times: u32,
    #[serde(default = "default_tap_delay")]
    pub tap_delay: f64,
    /// Detection threshold; falls back to the game's per-template threshold
    #[serde(default)]
    pub likelihood: Option<f64>,
    #[serde(default)]
    pub delay_before: f64,
    #[serde(default)]
    pub delay_after: f64,
    /// Keep retrying for this long, then skip the tap instead of failing
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typing {
    pub text: String,
    /// Field to tap (focus) before typing
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub clear_first: bool,
    #[serde(default)]
    pub press_enter: bool,
    #[serde(default)]
    pub delay_before: f64,
    #[serde(default)]
    pub delay_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wait {
    #[serde(default)]
    pub duration: f64,
    /// Template to wait for instead of a plain sleep
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub likelihood: Option<f64>,
    /// Bound for condition waits, 60s when absent
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Swipe endpoint: a fixed point or a template resolved on the current frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    At((i32, i32)),
    Template {
        template: String,
        #[serde(default)]
        likelihood: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swipe {
    pub start: Target,
    pub end: Target,
    #[serde(default = "default_swipe_ms")]
    pub duration_ms: u64,
    #[serde(default)]
    pub delay_before: f64,
    #[serde(default)]
    pub delay_after: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Screenshot {
    /// Destination file; `{device}` is replaced by the device id
    #[serde(default)]
    pub save_path: Option<String>,
    #[serde(default)]
    pub process_items: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restart {
    #[serde(default)]
    pub delay_before: f64,
    #[serde(default)]
    pub delay_after: f64,
    #[serde(default = "default_restart_timeout")]
    pub timeout: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Counter {
    #[serde(default)]
    pub delay_before: f64,
    #[serde(default)]
    pub delay_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub condition: String,
    #[serde(default)]
    pub likelihood: Option<f64>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub if_true: Vec<Action>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub if_false: Vec<Action>,
    #[serde(default)]
    pub if_true_state: Option<String>,
    #[serde(default)]
    pub if_false_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    #[serde(deserialize_with = "lenient_seq")]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Exit as soon as this template is on screen
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub condition_likelihood: Option<f64>,
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Reuse one captured frame for every detection in an iteration
    #[serde(default, alias = "use_single_screenshot")]
    pub single_frame: bool,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Macro(_) => "macro",
            Action::Tap(_) => "tap",
            Action::Typing(_) => "typing",
            Action::Wait(_) => "wait",
            Action::Swipe(_) => "swipe",
            Action::Screenshot(_) => "screenshot",
            Action::Restart(_) => "restart",
            Action::Counter(_) => "counter",
            Action::Conditional(_) => "conditional",
            Action::Loop(_) => "loop",
        }
    }

    /// Shorthand constructor used by tests and the demo graph.
    pub fn tap(template: impl Into<String>) -> Self {
        Action::Tap(Tap {
            template: template.into(),
            coordinates: None,
            offset_x: 0,
            offset_y: 0,
            tap_times: 1,
            tap_delay: default_tap_delay(),
            likelihood: None,
            delay_before: 0.0,
            delay_after: 0.0,
            timeout: None,
        })
    }

    pub fn counter() -> Self {
        Action::Counter(Counter::default())
    }

    pub fn wait(seconds: f64) -> Self {
        Action::Wait(Wait { duration: seconds, condition: None, likelihood: None, timeout: None })
    }

    /// State names this action may jump to, including nested actions.
    pub fn jump_targets(&self) -> Vec<&str> {
        match self {
            Action::Conditional(c) => {
                let mut out: Vec<&str> = c.if_true_state.iter()
                    .chain(c.if_false_state.iter())
                    .map(String::as_str)
                    .collect();
                for a in c.if_true.iter().chain(c.if_false.iter()) {
                    out.extend(a.jump_targets());
                }
                out
            }
            Action::Loop(l) => l.actions.iter().flat_map(|a| a.jump_targets()).collect(),
            _ => Vec::new(),
        }
    }

    /// Static checks run once when the graph is loaded. Returns one message per problem.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let likelihood = |errors: &mut Vec<String>, what: &str, v: Option<f64>| {
            if let Some(v) = v {
                if !(0.0..=1.0).contains(&v) {
                    errors.push(format!("{} likelihood must be between 0.0 and 1.0, got {}", what, v));
                }
            }
        };
        let non_negative = |errors: &mut Vec<String>, what: &str, v: f64| {
            if v < 0.0 || !v.is_finite() {
                errors.push(format!("{} must be a non-negative number, got {}", what, v));
            }
        };
        let positive = |errors: &mut Vec<String>, what: &str, v: f64| {
            if v <= 0.0 || !v.is_finite() {
                errors.push(format!("{} must be a positive number, got {}", what, v));
            }
        };

        match self {
            Action::Macro(m) => {
                if m.name.trim().is_empty() {
                    errors.push("macro action needs a name".into());
                }
                if let Some(s) = m.speed_multiplier {
                    if !s.is_finite() || s < 0.1 {
                        errors.push(format!("macro speed multiplier must be >= 0.1, got {}", s));
                    }
                }
            }
            Action::Tap(t) => {
                if t.template.is_empty() && t.coordinates.is_none() {
                    errors.push("tap action needs a template or coordinates".into());
                }
                if t.tap_times == 0 {
                    errors.push("tap_times must be at least 1".into());
                }
                likelihood(&mut errors, "tap", t.likelihood);
                non_negative(&mut errors, "tap_delay", t.tap_delay);
                non_negative(&mut errors, "delay_before", t.delay_before);
                non_negative(&mut errors, "delay_after", t.delay_after);
                if let Some(timeout) = t.timeout {
                    positive(&mut errors, "tap timeout", timeout);
                }
            }
            Action::Typing(t) => {
                if t.text.is_empty() {
                    errors.push("typing action needs text".into());
                }
                non_negative(&mut errors, "delay_before", t.delay_before);
                non_negative(&mut errors, "delay_after", t.delay_after);
            }
            Action::Wait(w) => {
                non_negative(&mut errors, "wait duration", w.duration);
                likelihood(&mut errors, "wait", w.likelihood);
                if let Some(timeout) = w.timeout {
                    non_negative(&mut errors, "wait timeout", timeout);
                }
            }
            Action::Swipe(s) => {
                for (name, target) in [("start", &s.start), ("end", &s.end)] {
                    if let Target::Template { template, likelihood: l } = target {
                        if template.is_empty() {
                            errors.push(format!("swipe {} needs a template or coordinates", name));
                        }
                        likelihood(&mut errors, name, *l);
                    }
                }
                non_negative(&mut errors, "delay_before", s.delay_before);
                non_negative(&mut errors, "delay_after", s.delay_after);
            }
            Action::Screenshot(_) => {}
            Action::Restart(r) => {
                non_negative(&mut errors, "restart delay_before", r.delay_before);
                non_negative(&mut errors, "restart delay_after", r.delay_after);
                positive(&mut errors, "restart timeout", r.timeout);
            }
            Action::Counter(c) => {
                non_negative(&mut errors, "counter delay_before", c.delay_before);
                non_negative(&mut errors, "counter delay_after", c.delay_after);
            }
            Action::Conditional(c) => {
                if c.condition.is_empty() {
                    errors.push("conditional action needs a condition template".into());
                }
                likelihood(&mut errors, "conditional", c.likelihood);
                for a in c.if_true.iter().chain(c.if_false.iter()) {
                    errors.extend(a.validate());
                }
            }
            Action::Loop(l) => {
                if l.actions.is_empty() {
                    errors.push("loop action needs at least one nested action".into());
                }
                if l.max_iterations.is_none() && l.condition.is_none() && l.timeout.is_none() {
                    errors.push("loop action needs max_iterations, condition or timeout".into());
                }
                likelihood(&mut errors, "loop condition", l.condition_likelihood);
                if let Some(timeout) = l.timeout {
                    positive(&mut errors, "loop timeout", timeout);
                }
                for a in &l.actions {
                    errors.extend(a.validate());
                }
            }
        }
        errors
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Macro(m) => write!(f, "macro '{}'", m.name),
            Action::Tap(t) => match t.coordinates {
                Some((x, y)) => write!(f, "tap '{}' at ({}, {})", t.template, x, y),
                None => write!(f, "tap '{}'", t.template),
            },
            Action::Typing(t) => write!(f, "type {} chars", t.text.chars().count()),
            Action::Wait(w) => match &w.condition {
                Some(c) => write!(f, "wait for '{}'", c),
                None => write!(f, "wait {:.1}s", w.duration),
            },
            Action::Swipe(_) => write!(f, "swipe"),
            Action::Screenshot(_) => write!(f, "screenshot"),
            Action::Restart(_) => write!(f, "restart app"),
            Action::Counter(_) => write!(f, "counter"),
            Action::Conditional(c) => write!(f, "if '{}'", c.condition),
            Action::Loop(l) => write!(f, "loop of {}", l.actions.len()),
        }
    }
}
