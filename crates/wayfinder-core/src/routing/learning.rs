//! Outcome statistics per (category, model)
//!
//! Rebuilt from persisted learning records at startup and updated once per
//! finished goal. The router reads it only to order otherwise interchangeable
//! candidates.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::debug;

use crate::goals::{LearningOutcome, LearningRecord};

use super::types::TaskCategory;

/// Attempts and successes for one (category, model) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeStats {
    pub attempts: u64,
    pub successes: u64,
}

impl OutcomeStats {
    /// successes / attempts; 0.0 with no history
    pub fn confidence(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// One row of [`LearningLedger::all`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeSummary {
    pub category: TaskCategory,
    pub model_id: String,
    pub stats: OutcomeStats,
}

#[derive(Debug, Default)]
pub struct LearningLedger {
    stats: RwLock<HashMap<(TaskCategory, String), OutcomeStats>>,
}

impl LearningLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild statistics from history
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a LearningRecord>) -> Self {
        let ledger = Self::new();
        let mut count = 0usize;
        for record in records {
            if let Some(model_id) = &record.model_id {
                ledger.observe(record.category, model_id, record.outcome);
                count += 1;
            }
        }
        debug!(records = count, "Rebuilt learning statistics");
        ledger
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<(TaskCategory, String), OutcomeStats>> {
        self.stats.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<(TaskCategory, String), OutcomeStats>> {
        self.stats.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Fold one finished goal into the statistics
    ///
    /// Cancelled goals leave the statistics unchanged. Returns the stats after
    /// the update.
    pub fn observe(
        &self,
        category: TaskCategory,
        model_id: &str,
        outcome: LearningOutcome,
    ) -> OutcomeStats {
        let mut stats = self.write();
        let entry = stats.entry((category, model_id.to_string())).or_default();
        match outcome {
            LearningOutcome::Completed => {
                entry.attempts += 1;
                entry.successes += 1;
            }
            LearningOutcome::Failed => entry.attempts += 1,
            LearningOutcome::Cancelled => {}
        }
        *entry
    }

    pub fn stats(&self, category: TaskCategory, model_id: &str) -> Option<OutcomeStats> {
        self.read()
            .get(&(category, model_id.to_string()))
            .copied()
    }

    /// Confidence for a pair, `None` when it has never been attempted
    pub fn confidence(&self, category: TaskCategory, model_id: &str) -> Option<f64> {
        self.stats(category, model_id)
            .filter(|s| s.attempts > 0)
            .map(|s| s.confidence())
    }

    /// Every pair with history, sorted by category then model
    pub fn all(&self) -> Vec<OutcomeSummary> {
        let mut rows: Vec<OutcomeSummary> = self
            .read()
            .iter()
            .filter(|(_, stats)| stats.attempts > 0)
            .map(|((category, model_id), stats)| OutcomeSummary {
                category: *category,
                model_id: model_id.clone(),
                stats: *stats,
            })
            .collect();
        rows.sort_by(|a, b| a.category.cmp(&b.category).then(a.model_id.cmp(&b.model_id)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_outcomes() {
        let ledger = LearningLedger::new();

        ledger.observe(TaskCategory::Chat, "m", LearningOutcome::Completed);
        ledger.observe(TaskCategory::Chat, "m", LearningOutcome::Failed);
        let stats = ledger.observe(TaskCategory::Chat, "m", LearningOutcome::Completed);

        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.successes, 2);
        assert!((ledger.confidence(TaskCategory::Chat, "m").unwrap() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cancelled_does_not_change_stats() {
        let ledger = LearningLedger::new();
        ledger.observe(TaskCategory::Coding, "m", LearningOutcome::Completed);
        let stats = ledger.observe(TaskCategory::Coding, "m", LearningOutcome::Cancelled);

        assert_eq!(stats, OutcomeStats { attempts: 1, successes: 1 });
    }

    #[test]
    fn test_unknown_pair_has_no_confidence() {
        let ledger = LearningLedger::new();
        assert!(ledger.confidence(TaskCategory::Chat, "m").is_none());

        ledger.observe(TaskCategory::Chat, "m", LearningOutcome::Cancelled);
        assert!(ledger.confidence(TaskCategory::Chat, "m").is_none());
        assert!(ledger.all().is_empty());
    }

    #[test]
    fn test_rebuild_from_records() {
        let records = vec![
            LearningRecord::new("g1", TaskCategory::Chat, Some("a".into()), LearningOutcome::Completed),
            LearningRecord::new("g2", TaskCategory::Chat, Some("a".into()), LearningOutcome::Failed),
            LearningRecord::new("g3", TaskCategory::Chat, None, LearningOutcome::Failed),
            LearningRecord::new("g4", TaskCategory::Coding, Some("b".into()), LearningOutcome::Completed),
        ];

        let ledger = LearningLedger::from_records(&records);
        let all = ledger.all();

        assert_eq!(all.len(), 2);
        assert_eq!(all[0].category, TaskCategory::Chat);
        assert_eq!(all[0].stats, OutcomeStats { attempts: 2, successes: 1 });
        assert_eq!(all[1].model_id, "b");
    }
}
