//! Automation graph: the static set of named states a game cycles through.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::{lenient_seq, Action};
use crate::error::{Error, Result};

/// One node of the automation graph. Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Filled from the key of the `states` table
    #[serde(skip)]
    pub name: String,
    /// Seconds before the watchdog forces a restart; absent or 0 means never
    #[serde(default, alias = "timeout_seconds")]
    pub timeout: Option<f64>,
    /// Templates that must all be on screen before the actions run
    #[serde(default, alias = "templates", deserialize_with = "lenient_seq")]
    pub required_templates: Vec<String>,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub processes_items: bool,
    #[serde(default, deserialize_with = "lenient_seq")]
    pub next_states: Vec<String>,
    /// Finishing this state ends the session (score, notify, reset counters)
    #[serde(default)]
    pub completes_session: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_next(mut self, next: &[&str]) -> Self {
        self.next_states = next.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_templates(mut self, templates: &[&str]) -> Self {
        self.required_templates = templates.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Watchdog limit scaled by the speed multiplier, `None` when the state never times out.
    pub fn effective_timeout(&self, speed_multiplier: f64) -> Option<Duration> {
        match self.timeout {
            Some(t) if t > 0.0 => Duration::try_from_secs_f64(t * speed_multiplier.max(0.0)).ok(),
            _ => None,
        }
    }

    pub fn allows(&self, next: &str) -> bool {
        self.next_states.iter().any(|s| s == next)
    }
}

/// Shape of a graph as written in a game script or JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphDef {
    #[serde(default)]
    pub entry: Option<String>,
    pub states: BTreeMap<String, StateDefinition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutomationGraph {
    entry: String,
    states: BTreeMap<String, StateDefinition>,
}

impl AutomationGraph {
    /// Build and validate a graph from a list of states.
    pub fn new(entry: impl Into<String>, states: Vec<StateDefinition>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for state in states {
            if map.contains_key(&state.name) {
                return Err(Error::graph(format!("duplicate state '{}'", state.name)));
            }
            map.insert(state.name.clone(), state);
        }
        let graph = Self { entry: entry.into(), states: map };
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_def(def: GraphDef) -> Result<Self> {
        let entry = match def.entry {
            Some(e) => e,
            None if def.states.len() == 1 => def.states.keys().next().cloned().unwrap_or_default(),
            None => return Err(Error::graph("graph with several states needs an `entry` state")),
        };
        let states = def
            .states
            .into_iter()
            .map(|(name, mut state)| {
                state.name = name;
                state
            })
            .collect();
        Self::new(entry, states)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn get(&self, name: &str) -> Option<&StateDefinition> {
        self.states.get(name)
    }

    pub fn state(&self, name: &str) -> Result<&StateDefinition> {
        self.states.get(name).ok_or_else(|| Error::UnknownState(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if !self.states.contains_key(&self.entry) {
            return Err(Error::graph(format!("entry state '{}' is not defined", self.entry)));
        }
        let mut problems = Vec::new();
        for (name, state) in &self.states {
            if state.next_states.is_empty() {
                problems.push(format!("{}: no next_states", name));
            }
            for next in &state.next_states {
                if !self.states.contains_key(next) {
                    problems.push(format!("{}: next state '{}' is not defined", name, next));
                }
            }
            if let Some(t) = state.timeout {
                if !t.is_finite() || t < 0.0 {
                    problems.push(format!("{}: timeout must be a finite non-negative number, got {}", name, t));
                }
            }
            for (i, action) in state.actions.iter().enumerate() {
                for e in action.validate() {
                    problems.push(format!("{}: action {} ({}): {}", name, i, action.kind(), e));
                }
                for target in action.jump_targets() {
                    if !state.allows(target) {
                        problems.push(format!("{}: action {} jumps to '{}' outside next_states", name, i, target));
                    }
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::graph(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_states() -> Vec<StateDefinition> {
        vec![
            StateDefinition::new("a").with_actions(vec![Action::tap("t1")]).with_next(&["b"]),
            StateDefinition::new("b").with_next(&["a"]),
        ]
    }

    #[test]
    fn test_valid_graph() {
        let g = AutomationGraph::new("a", two_states()).unwrap();
        assert_eq!(g.entry(), "a");
        assert_eq!(g.len(), 2);
        assert!(g.state("b").is_ok());
        assert!(matches!(g.state("zzz"), Err(Error::UnknownState(_))));
    }

    #[test]
    fn test_dangling_next_state_is_rejected() {
        let states = vec![StateDefinition::new("a").with_next(&["missing"])];
        let err = AutomationGraph::new("a", states).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_unknown_entry_is_rejected() {
        assert!(AutomationGraph::new("nope", two_states()).is_err());
    }

    #[test]
    fn test_effective_timeout_scales_with_speed() {
        let s = StateDefinition::new("s").with_timeout(10.0);
        assert_eq!(s.effective_timeout(2.0), Some(Duration::from_secs(20)));
        assert_eq!(StateDefinition::new("s").with_timeout(0.0).effective_timeout(2.0), None);
        assert_eq!(StateDefinition::new("s").effective_timeout(2.0), None);
        assert_eq!(StateDefinition::new("s").with_timeout(f64::INFINITY).effective_timeout(2.0), None);
    }

    #[test]
    fn test_non_finite_timeout_is_rejected() {
        for t in [f64::INFINITY, f64::NAN] {
            let states = vec![StateDefinition::new("a").with_timeout(t).with_next(&["a"])];
            let err = AutomationGraph::new("a", states).unwrap_err();
            assert!(err.to_string().contains("timeout"), "{}", err);
        }
    }

    #[test]
    fn test_from_json_def_fills_names() {
        let def: GraphDef = serde_json::from_str(
            r#"{"entry":"idle","states":{
                "idle":{"templates":["home"],"next_states":["pull"]},
                "pull":{"timeout":30,"actions":[{"type":"counter"}],"next_states":["idle"],"processes_items":true}
            }}"#,
        )
        .unwrap();
        let g = AutomationGraph::from_def(def).unwrap();
        assert_eq!(g.state("idle").unwrap().required_templates, vec!["home"]);
        assert_eq!(g.state("pull").unwrap().name, "pull");
        assert!(g.state("pull").unwrap().processes_items);
    }

    #[test]
    fn test_conditional_jump_outside_next_states_is_rejected() {
        let def: GraphDef = serde_json::from_str(
            r#"{"entry":"a","states":{
                "a":{"actions":[{"type":"conditional","condition":"x","if_true_state":"c"}],"next_states":["b"]},
                "b":{"next_states":["a"]},
                "c":{"next_states":["a"]}
            }}"#,
        )
        .unwrap();
        assert!(AutomationGraph::from_def(def).is_err());
    }
}
