//! Resumable position inside a state's action list.

use crate::action::Action;
use crate::error::ActionError;
use crate::graph::StateDefinition;

/// What an action run produced, applied to the instance together with the
/// cursor advance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Effects {
    /// Increments to the session counter
    pub counter: u64,
    /// Items detected on screen
    pub items: Vec<String>,
    /// State selected by a conditional action; replaces the transition policy
    pub jump: Option<String>,
}

impl Effects {
    pub fn merge(&mut self, other: Effects) {
        self.counter += other.counter;
        self.items.extend(other.items);
        if other.jump.is_some() {
            self.jump = other.jump;
        }
    }
}

#[derive(Debug)]
pub enum ActionResult {
    /// Nothing left to run in this state
    Exhausted,
    Completed(Effects),
    Failed(ActionError),
}

/// Index of the next action to run. Moves forward only on success and back to
/// zero only on a state transition or a recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCursor {
    position: usize,
}

impl ActionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current<'a>(&self, state: &'a StateDefinition) -> Option<&'a Action> {
        state.actions.get(self.position)
    }

    pub fn is_exhausted(&self, state: &StateDefinition) -> bool {
        self.position >= state.actions.len()
    }

    pub fn advance(&mut self, state: &StateDefinition) {
        if !self.is_exhausted(state) {
            self.position += 1;
        }
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Apply an action result: advance on success, stay put otherwise.
    /// Returns the effects to fold into the instance.
    pub fn commit(&mut self, state: &StateDefinition, result: ActionResult) -> Option<Effects> {
        match result {
            ActionResult::Completed(effects) => {
                self.advance(state);
                Some(effects)
            }
            ActionResult::Failed(_) | ActionResult::Exhausted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StateDefinition {
        StateDefinition::new("a").with_actions(vec![Action::tap("t1"), Action::tap("t2")]).with_next(&["a"])
    }

    #[test]
    fn test_failure_leaves_cursor_in_place() {
        let s = state();
        let mut c = ActionCursor::new();
        c.commit(&s, ActionResult::Completed(Effects::default()));
        for _ in 0..5 {
            assert!(c.commit(&s, ActionResult::Failed(ActionError::TemplateNotFound("t2".into()))).is_none());
        }
        assert_eq!(c.position(), 1);
        assert_eq!(c.current(&s), Some(&Action::tap("t2")));
    }

    #[test]
    fn test_cursor_never_passes_the_end() {
        let s = state();
        let mut c = ActionCursor::new();
        for _ in 0..4 {
            c.advance(&s);
        }
        assert_eq!(c.position(), 2);
        assert!(c.is_exhausted(&s));
        assert!(c.current(&s).is_none());
        c.reset();
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn test_empty_state_is_exhausted_immediately() {
        let s = StateDefinition::new("e").with_next(&["e"]);
        assert!(ActionCursor::new().is_exhausted(&s));
    }

    #[test]
    fn test_effects_merge_keeps_last_jump() {
        let mut e = Effects { counter: 1, items: vec!["a".into()], jump: Some("x".into()) };
        e.merge(Effects { counter: 2, items: vec!["b".into()], jump: None });
        assert_eq!(e.counter, 3);
        assert_eq!(e.items, vec!["a", "b"]);
        assert_eq!(e.jump.as_deref(), Some("x"));
    }
}
