//! Tabular Q-values with batch rollback and a byte budget.
//!
//! Updates follow the Bellman rule
//! `Q(s,a) <- Q(s,a) + alpha * (r + gamma * max_a' Q(s',a') - Q(s,a))`.
//! A non-finite result is never written. Inside a batch every write records
//! the entry's prior value so the whole batch can be undone.
use super::encoding::StateKey;
use crate::error::{SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fixed per-entry overhead used by the size estimate.
const ENTRY_OVERHEAD_BYTES: usize = 48;

/// Fraction of the budget the table is pruned down to.
const PRUNE_TARGET: f64 = 0.9;

/// Value and bookkeeping of one `(state, action)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QEntry {
    /// Current Q-value
    pub value: f64,
    /// Number of updates applied
    pub visits: u64,
    /// Logical tick of the last update
    pub last_updated: u64,
}

/// Flat form used for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QRecord {
    /// Encoded state
    pub state: StateKey,
    /// Action
    pub action: String,
    /// Entry data
    #[serde(flatten)]
    pub entry: QEntry,
}

struct Undo {
    state: StateKey,
    action: String,
    previous: Option<QEntry>,
}

/// Q-table keyed by state, then action.
pub struct QTable {
    rows: BTreeMap<StateKey, BTreeMap<String, QEntry>>,
    tick: u64,
    byte_budget: usize,
    estimated_bytes: usize,
    undo: Option<Vec<Undo>>,
}

impl std::fmt::Debug for QTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QTable")
            .field("entries", &self.len())
            .field("estimated_bytes", &self.estimated_bytes)
            .field("byte_budget", &self.byte_budget)
            .finish()
    }
}

impl QTable {
    /// Empty table with a byte budget.
    pub fn new(byte_budget: usize) -> Self {
        Self {
            rows: BTreeMap::new(),
            tick: 0,
            byte_budget,
            estimated_bytes: 0,
            undo: None,
        }
    }

    /// Q-value of a pair, 0 if unseen.
    pub fn value(&self, state: &StateKey, action: &str) -> f64 {
        self.get(state, action).map_or(0.0, |e| e.value)
    }

    /// Entry of a pair.
    pub fn get(&self, state: &StateKey, action: &str) -> Option<&QEntry> {
        self.rows.get(state)?.get(action)
    }

    /// Highest Q-value in a state, 0 if unseen.
    pub fn max_value(&self, state: &StateKey) -> f64 {
        self.rows
            .get(state)
            .and_then(|row| row.values().map(|e| e.value).reduce(f64::max))
            .unwrap_or(0.0)
    }

    /// Actions of a state sorted by descending value (ties by name).
    pub fn ranked_actions(&self, state: &StateKey) -> Vec<(String, QEntry)> {
        let mut actions: Vec<(String, QEntry)> = self
            .rows
            .get(state)
            .map(|row| row.iter().map(|(a, e)| (a.clone(), *e)).collect())
            .unwrap_or_default();
        actions.sort_by(|a, b| b.1.value.total_cmp(&a.1.value).then_with(|| a.0.cmp(&b.0)));
        actions
    }

    /// Greedy action of a state.
    pub fn best_action(&self, state: &StateKey) -> Option<String> {
        self.ranked_actions(state).into_iter().next().map(|(a, _)| a)
    }

    /// All known states.
    pub fn states(&self) -> impl Iterator<Item = &StateKey> {
        self.rows.keys()
    }

    /// Apply one Bellman update and return the new value.
    ///
    /// Fails with `Divergence` and leaves the table unchanged when the
    /// result is not finite.
    pub fn update(
        &mut self,
        state: &StateKey,
        action: &str,
        reward: f64,
        next_state: &StateKey,
        learning_rate: f64,
        discount_factor: f64,
    ) -> SwarmResult<f64> {
        let current = self.value(state, action);
        let target = reward + discount_factor * self.max_value(next_state);
        let updated = current + learning_rate * (target - current);
        if !updated.is_finite() {
            return Err(SwarmError::Divergence {
                state: state.to_string(),
                action: action.to_string(),
            });
        }

        self.tick += 1;
        let previous = self.get(state, action).copied();
        if let Some(undo) = self.undo.as_mut() {
            undo.push(Undo {
                state: state.clone(),
                action: action.to_string(),
                previous,
            });
        }
        if previous.is_none() {
            self.estimated_bytes += entry_bytes(state, action);
        }
        let visits = previous.map_or(0, |e| e.visits) + 1;
        self.rows.entry(state.clone()).or_default().insert(
            action.to_string(),
            QEntry {
                value: updated,
                visits,
                last_updated: self.tick,
            },
        );
        Ok(updated)
    }

    /// Start recording undo information.
    pub fn begin_batch(&mut self) {
        self.undo = Some(Vec::new());
    }

    /// Keep the batch's writes.
    pub fn commit_batch(&mut self) {
        self.undo = None;
    }

    /// Undo every write since `begin_batch`, newest first.
    pub fn rollback_batch(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        for record in undo.into_iter().rev() {
            match record.previous {
                Some(entry) => {
                    if let Some(row) = self.rows.get_mut(&record.state) {
                        row.insert(record.action, entry);
                    }
                }
                None => self.remove(&record.state, &record.action),
            }
        }
    }

    fn remove(&mut self, state: &StateKey, action: &str) {
        if let Some(row) = self.rows.get_mut(state) {
            if row.remove(action).is_some() {
                self.estimated_bytes = self
                    .estimated_bytes
                    .saturating_sub(entry_bytes(state, action));
            }
            if row.is_empty() {
                self.rows.remove(state);
            }
        }
    }

    /// Evict least recently updated entries once over budget.
    ///
    /// Prunes down to 90% of the budget. Returns the number evicted.
    pub fn enforce_budget(&mut self) -> usize {
        if self.estimated_bytes <= self.byte_budget {
            return 0;
        }
        let target = (self.byte_budget as f64 * PRUNE_TARGET) as usize;

        let mut by_age: Vec<(u64, StateKey, String)> = self
            .rows
            .iter()
            .flat_map(|(s, row)| {
                row.iter()
                    .map(move |(a, e)| (e.last_updated, s.clone(), a.clone()))
            })
            .collect();
        by_age.sort();

        let mut evicted = 0;
        for (_, state, action) in by_age {
            if self.estimated_bytes <= target {
                break;
            }
            self.remove(&state, &action);
            evicted += 1;
        }
        tracing::debug!(
            evicted,
            estimated_bytes = self.estimated_bytes,
            budget = self.byte_budget,
            "Pruned Q-table"
        );
        evicted
    }

    /// Number of `(state, action)` entries.
    pub fn len(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Estimated memory footprint in bytes.
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    /// Flatten for persistence.
    pub fn records(&self) -> Vec<QRecord> {
        self.rows
            .iter()
            .flat_map(|(state, row)| {
                row.iter().map(move |(action, entry)| QRecord {
                    state: state.clone(),
                    action: action.clone(),
                    entry: *entry,
                })
            })
            .collect()
    }

    /// Rebuild from persisted records.
    pub fn from_records(records: Vec<QRecord>, byte_budget: usize) -> Self {
        let mut table = Self::new(byte_budget);
        for record in records {
            table.tick = table.tick.max(record.entry.last_updated);
            table.estimated_bytes += entry_bytes(&record.state, &record.action);
            table
                .rows
                .entry(record.state)
                .or_default()
                .insert(record.action, record.entry);
        }
        table
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.estimated_bytes = 0;
        self.undo = None;
    }
}

fn entry_bytes(state: &StateKey, action: &str) -> usize {
    state.as_str().len() + action.len() + ENTRY_OVERHEAD_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(name: &str) -> StateKey {
        StateKey::new(name)
    }

    #[test]
    fn test_bellman_update() {
        let mut table = QTable::new(usize::MAX);
        let v = table.update(&s("a"), "x", 1.0, &s("b"), 0.5, 0.9).unwrap();
        assert!((v - 0.5).abs() < 1e-12);

        table.update(&s("b"), "y", 2.0, &s("b"), 1.0, 0.0).unwrap();
        // target = 1 + 0.9 * 2 = 2.8; 0.5 + 0.5 * (2.8 - 0.5) = 1.65
        let v = table.update(&s("a"), "x", 1.0, &s("b"), 0.5, 0.9).unwrap();
        assert!((v - 1.65).abs() < 1e-12);
        assert_eq!(table.get(&s("a"), "x").unwrap().visits, 2);
    }

    #[test]
    fn test_divergence_leaves_table_unchanged() {
        let mut table = QTable::new(usize::MAX);
        table.update(&s("a"), "x", 1.0, &s("a"), 0.1, 0.9).unwrap();
        let before = table.value(&s("a"), "x");

        let result = table.update(&s("a"), "x", f64::NAN, &s("a"), 0.1, 0.9);
        assert!(matches!(result, Err(SwarmError::Divergence { .. })));
        assert_eq!(table.value(&s("a"), "x"), before);
    }

    #[test]
    fn test_rollback_restores_batch() {
        let mut table = QTable::new(usize::MAX);
        table.update(&s("a"), "x", 1.0, &s("a"), 0.1, 0.9).unwrap();
        let snapshot = table.records();

        table.begin_batch();
        table.update(&s("a"), "x", 5.0, &s("a"), 0.1, 0.9).unwrap();
        table.update(&s("b"), "y", 5.0, &s("a"), 0.1, 0.9).unwrap();
        table.rollback_batch();

        assert_eq!(table.records(), snapshot);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ranked_actions() {
        let mut table = QTable::new(usize::MAX);
        table.update(&s("a"), "low", -1.0, &s("z"), 1.0, 0.0).unwrap();
        table.update(&s("a"), "high", 3.0, &s("z"), 1.0, 0.0).unwrap();
        table.update(&s("a"), "mid", 1.0, &s("z"), 1.0, 0.0).unwrap();
        let ranked: Vec<String> = table.ranked_actions(&s("a")).into_iter().map(|(a, _)| a).collect();
        assert_eq!(ranked, vec!["high", "mid", "low"]);
        assert_eq!(table.best_action(&s("unseen")), None);
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let one = entry_bytes(&s("s00"), "a");
        let mut table = QTable::new(one * 10);
        for i in 0..11 {
            table
                .update(&s(&format!("s{:02}", i)), "a", 1.0, &s("end"), 0.1, 0.9)
                .unwrap();
        }
        let evicted = table.enforce_budget();
        assert_eq!(evicted, 2);
        assert!(table.estimated_bytes() <= one * 9);
        assert!(table.get(&s("s00"), "a").is_none());
        assert!(table.get(&s("s10"), "a").is_some());
    }

    #[test]
    fn test_records_roundtrip() {
        let mut table = QTable::new(usize::MAX);
        table.update(&s("a"), "x", 1.0, &s("b"), 0.1, 0.9).unwrap();
        table.update(&s("b"), "y", 1.0, &s("a"), 0.1, 0.9).unwrap();
        let rebuilt = QTable::from_records(table.records(), usize::MAX);
        assert_eq!(rebuilt.records(), table.records());
        assert_eq!(rebuilt.estimated_bytes(), table.estimated_bytes());
    }
}
