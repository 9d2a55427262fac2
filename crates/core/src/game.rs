//! Game collaborator: one implementation per target game, injected into every
//! instance. It supplies the automation graph and answers the game-specific
//! questions the engine cannot (branching, cycle detection, items, scoring).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::graph::AutomationGraph;
use crate::types::{AppTarget, Frame};

pub const DEFAULT_THRESHOLD: f64 = 0.8;
pub const DEFAULT_CYCLES_PER_SESSION: u32 = 9;
pub const DEFAULT_ITEM_SCORE: u64 = 5;

/// Everything a game gets to look at when choosing among several next states.
#[derive(Debug, Clone, Serialize)]
pub struct BranchContext {
    pub device: String,
    pub state: String,
    pub candidates: Vec<String>,
    pub cycle_index: u32,
    pub cycles_per_session: u32,
    pub counter: u64,
    pub score: u64,
    pub session_count: u64,
    #[serde(skip)]
    pub frame: Frame,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreReport {
    pub total: u64,
    pub breakdown: BTreeMap<String, u64>,
}

/// Per-item scores with a fallback for unknown items. Lookups ignore case.
#[derive(Debug, Clone)]
pub struct ScoreTable {
    scores: HashMap<String, u64>,
    default_score: u64,
}

impl Default for ScoreTable {
    fn default() -> Self {
        Self { scores: HashMap::new(), default_score: DEFAULT_ITEM_SCORE }
    }
}

impl ScoreTable {
    pub fn new(scores: HashMap<String, u64>, default_score: u64) -> Self {
        let scores = scores.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
        Self { scores, default_score }
    }

    pub fn item(&self, name: &str) -> u64 {
        self.scores.get(&name.to_lowercase()).copied().unwrap_or(self.default_score)
    }

    pub fn score(&self, items: &[String]) -> ScoreReport {
        let mut report = ScoreReport::default();
        for item in items {
            let points = self.item(item);
            report.total += points;
            *report.breakdown.entry(item.clone()).or_default() += points;
        }
        report
    }
}

pub trait Game: Send + Sync {
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    fn app(&self) -> &AppTarget;

    fn graph(&self) -> Arc<AutomationGraph>;

    /// Handle used by the instance on `device`. Games holding an interpreter
    /// return a fresh one so hooks running on different devices never wait
    /// on each other; stateless games return themselves.
    fn for_instance(self: Arc<Self>, device: &str) -> Result<Arc<dyn Game>>;

    /// Detection threshold used when an action does not set its own likelihood.
    fn template_threshold(&self, _template: &str) -> f64 {
        DEFAULT_THRESHOLD
    }

    fn cycles_per_session(&self) -> u32 {
        DEFAULT_CYCLES_PER_SESSION
    }

    /// Session score at or above which a high-score notification goes out.
    fn notify_threshold(&self) -> Option<u64> {
        None
    }

    /// Pick one of `ctx.candidates`. Only called when there is more than one.
    fn resolve_branch(&self, ctx: &BranchContext) -> Result<String>;

    fn is_new_cycle(&self, _frame: &Frame, _device: &str) -> Result<bool> {
        Ok(true)
    }

    fn process_items(&self, _frame: &Frame, _device: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn score(&self, items: &[String]) -> ScoreReport {
        ScoreTable::default().score(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_table_is_case_insensitive_with_default() {
        let table = ScoreTable::new(HashMap::from([("Gold".to_string(), 50)]), 5);
        let report = table.score(&["gold".into(), "GOLD".into(), "rock".into()]);
        assert_eq!(report.total, 105);
        assert_eq!(report.breakdown["rock"], 5);
        assert_eq!(report.breakdown["gold"], 50);
    }

    #[test]
    fn test_empty_items_score_zero() {
        assert_eq!(ScoreTable::default().score(&[]).total, 0);
    }
}
