//! Discovered patterns shared through the store.
//!
//! A pattern is a `(state, action)` pair that proved itself: used often
//! enough with a high enough success rate. Patterns live in the fleet's
//! patterns partition as a [`PatternDocument`]; every upsert supersedes the
//! current record and keeps the previous one in a bounded history. Patterns
//! are never deleted automatically.
use super::encoding::StateKey;
use crate::error::{SwarmError, SwarmResult};
use crate::layout::KeyLayout;
use crate::storage::MemoryStore;
use crate::types::{OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A reusable strategy for a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Stable identifier derived from the signature
    pub id: String,
    /// Human-readable signature, `state => action`
    pub signature: String,
    /// Encoded state
    pub state: StateKey,
    /// Strategy
    pub action: String,
    /// Running mean of observed confidence, in `[0, 1]`
    pub confidence: f64,
    /// Latest observed success rate, in `[0, 1]`
    pub success_rate: f64,
    /// Times the pattern was observed or applied
    pub usage_count: u64,
    /// Agents and contexts that contributed
    pub contexts: BTreeSet<String>,
    /// First discovery
    pub created_at: DateTime<Utc>,
    /// Last observation or application
    pub last_used_at: DateTime<Utc>,
    /// Record version, starting at 1
    pub version: u64,
}

/// Stored form: the current record and superseded ones, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDocument {
    /// Current record
    pub current: Pattern,
    /// Superseded records
    #[serde(default)]
    pub history: Vec<Pattern>,
}

/// Evidence for a pattern from one agent.
#[derive(Debug, Clone)]
pub struct PatternObservation {
    /// Encoded state
    pub state: StateKey,
    /// Strategy
    pub action: String,
    /// Observed success rate
    pub success_rate: f64,
    /// Observed usage
    pub usage_count: u64,
    /// Observed confidence
    pub confidence: f64,
    /// Contributing context (usually the agent ID)
    pub context: String,
}

/// Result of an upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The pattern after the upsert
    pub pattern: Pattern,
    /// Whether this upsert created it
    pub created: bool,
}

/// Stable pattern ID for a `(state, action)` pair.
pub fn pattern_id(state: &StateKey, action: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(state.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(action.as_bytes());
    let hash = hasher.finalize().to_hex();
    format!("pat-{}", &hash.as_str()[..16])
}

/// Insert or supersede the pattern for an observation.
///
/// Conflicting concurrent upserts are retried once.
pub fn upsert(
    store: &MemoryStore,
    ctx: &OpContext,
    layout: &KeyLayout,
    observation: &PatternObservation,
    history_limit: usize,
) -> SwarmResult<UpsertOutcome> {
    let id = pattern_id(&observation.state, &observation.action);
    let now = store.clock().now();
    let mut created = false;

    let doc = store.update_json::<PatternDocument, _>(
        ctx,
        &layout.patterns_partition(),
        &id,
        StoreOptions::new(),
        |existing| {
            created = existing.is_none();
            Ok(match existing {
                None => PatternDocument {
                    current: Pattern {
                        id: id.clone(),
                        signature: format!("{} => {}", observation.state, observation.action),
                        state: observation.state.clone(),
                        action: observation.action.clone(),
                        confidence: observation.confidence.clamp(0.0, 1.0),
                        success_rate: observation.success_rate.clamp(0.0, 1.0),
                        usage_count: observation.usage_count,
                        contexts: BTreeSet::from([observation.context.clone()]),
                        created_at: now,
                        last_used_at: now,
                        version: 1,
                    },
                    history: Vec::new(),
                },
                Some(doc) => {
                    let previous = doc.current;
                    let n = previous.version as f64;
                    let mut next = previous.clone();
                    next.confidence = ((previous.confidence * n + observation.confidence) / (n + 1.0))
                        .clamp(0.0, 1.0);
                    next.success_rate = observation.success_rate.clamp(0.0, 1.0);
                    next.usage_count = previous.usage_count + 1;
                    next.contexts.insert(observation.context.clone());
                    next.last_used_at = now;
                    next.version = previous.version + 1;
                    supersede(doc.history, previous, next, history_limit)
                }
            })
        },
    )?;

    Ok(UpsertOutcome {
        pattern: doc.value.current,
        created,
    })
}

/// Record one application of a pattern, incrementing its usage count.
pub fn record_usage(
    store: &MemoryStore,
    ctx: &OpContext,
    layout: &KeyLayout,
    pattern_id: &str,
    history_limit: usize,
) -> SwarmResult<Pattern> {
    let now = store.clock().now();
    let partition = layout.patterns_partition();
    let doc = store.update_json::<PatternDocument, _>(
        ctx,
        &partition,
        pattern_id,
        StoreOptions::new(),
        |existing| {
            let doc = existing.ok_or_else(|| SwarmError::NotFound {
                partition: partition.clone(),
                key: pattern_id.to_string(),
            })?;
            let previous = doc.current;
            let mut next = previous.clone();
            next.usage_count += 1;
            next.last_used_at = now;
            next.version += 1;
            Ok(supersede(doc.history, previous, next, history_limit))
        },
    )?;
    Ok(doc.value.current)
}

fn supersede(
    mut history: Vec<Pattern>,
    previous: Pattern,
    current: Pattern,
    limit: usize,
) -> PatternDocument {
    history.push(previous);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
    PatternDocument { current, history }
}

/// Fetch one pattern document.
pub fn get(
    store: &MemoryStore,
    ctx: &OpContext,
    layout: &KeyLayout,
    pattern_id: &str,
) -> SwarmResult<PatternDocument> {
    Ok(store
        .retrieve_json::<PatternDocument>(ctx, &layout.patterns_partition(), pattern_id)?
        .value)
}

/// Current records of every readable pattern, by descending confidence.
///
/// Documents that fail to decode are skipped with a warning.
pub fn list(store: &MemoryStore, ctx: &OpContext, layout: &KeyLayout) -> SwarmResult<Vec<Pattern>> {
    let mut patterns = Vec::new();
    for entry in store.query(ctx, &layout.patterns_partition(), |_| true)? {
        match store.decoder().decode::<PatternDocument>(&entry.value) {
            Ok(doc) => patterns.push(doc.current),
            Err(e) => tracing::warn!(key = %entry.key, error = %e, "Skipping undecodable pattern"),
        }
    }
    patterns.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(patterns)
}
