//! Per-agent Q-learning engine.
//!
//! Each agent exclusively owns one engine. Learning runs inline on the
//! agent's own execution path:
//!
//! 1. encode the execution into `(state, action, reward, next_state)`
//! 2. apply the Bellman update immediately
//! 3. append the experience to the replay buffer
//! 4. every `update_frequency` events, replay the most recent `batch_size`
//!    experiences as one batch
//! 5. upsert a pattern once the pair is used often and successfully enough
//! 6. every `persist_every` events, persist in the background
//!
//! A non-finite Q-value rolls back the update (or the whole batch) and
//! returns `Divergence`. After `max_consecutive_failures` divergences in a
//! row the engine disables itself rather than train on corrupted state.
use super::encoding::{
    self, ENCODING_VERSION, PreviousOutcome, StateFeatures, StateKey, TaskDescriptor, TaskOutcome,
};
use super::patterns::{self, Pattern, PatternObservation};
use super::q_table::{QRecord, QTable};
use super::replay::{Experience, ReplayBuffer};
use crate::bus::{EventBus, FleetEvent};
use crate::config::LearningConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::layout::{KeyLayout, STATE_KEY};
use crate::storage::MemoryStore;
use crate::types::{Acl, AgentId, OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Visits at which a recommendation's visit factor reaches one half.
const CONFIDENCE_VISIT_SCALE: f64 = 5.0;

/// Called with the error of a failed background persistence.
pub type PersistErrorCallback = Arc<dyn Fn(&SwarmError) + Send + Sync>;

/// Recommended strategy for a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecommendation {
    /// Greedy action
    pub strategy: String,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Q-value margin over the mean of the other known actions
    pub expected_improvement: f64,
    /// Up to three next-best actions
    pub alternatives: Vec<StrategyAlternative>,
}

/// A runner-up strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyAlternative {
    /// Action
    pub strategy: String,
    /// Its Q-value
    pub q_value: f64,
}

/// Engine status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStatus {
    /// Owning agent
    pub agent_id: AgentId,
    /// Whether the engine learns and recommends
    pub enabled: bool,
    /// Why it was disabled, if it was
    pub disabled_reason: Option<String>,
    /// Learning events applied since the state was created
    pub total_experiences: u64,
    /// Experiences held in the replay buffer
    pub buffered_experiences: usize,
    /// Current epsilon
    pub exploration_rate: f64,
    /// Patterns this engine discovered
    pub pattern_count: usize,
    /// Q-table entries
    pub q_table_entries: usize,
    /// Divergences since the last successful update
    pub consecutive_failures: u32,
}

/// What one learning event did.
#[derive(Debug, Clone)]
pub struct LearningUpdate {
    /// Reward assigned
    pub reward: f64,
    /// New Q-value of the pair
    pub q_value: f64,
    /// Whether a batch replay ran
    pub replayed: bool,
    /// Pattern upserted by this event
    pub pattern: Option<Pattern>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct UsageStats {
    uses: u64,
    successes: u64,
}

impl UsageStats {
    fn success_rate(&self) -> f64 {
        if self.uses == 0 {
            0.0
        } else {
            self.successes as f64 / self.uses as f64
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageRecord {
    state: StateKey,
    action: String,
    #[serde(flatten)]
    stats: UsageStats,
}

/// Serialized engine state stored under the agent's learning partition.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    encoding_version: u32,
    exploration_rate: f64,
    total_events: u64,
    q_table: Vec<QRecord>,
    experiences: Vec<Experience>,
    previous_outcomes: BTreeMap<String, PreviousOutcome>,
    usage: Vec<UsageRecord>,
    discovered: BTreeSet<String>,
    saved_at: DateTime<Utc>,
}

/// Tabular Q-learning engine owned by one agent.
pub struct LearningEngine {
    agent_id: AgentId,
    ctx: OpContext,
    config: LearningConfig,
    store: Arc<MemoryStore>,
    layout: KeyLayout,
    bus: Option<Arc<dyn EventBus>>,
    on_persist_error: Option<PersistErrorCallback>,

    q_table: QTable,
    replay: ReplayBuffer,
    exploration_rate: f64,
    enabled: bool,
    disabled_reason: Option<String>,
    /// Set when restore found unreadable state; persistence is suppressed
    corrupt_state: bool,
    total_events: u64,
    consecutive_failures: u32,
    previous_outcomes: BTreeMap<String, PreviousOutcome>,
    usage: HashMap<(StateKey, String), UsageStats>,
    discovered: BTreeSet<String>,
}

impl std::fmt::Debug for LearningEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningEngine")
            .field("agent_id", &self.agent_id)
            .field("enabled", &self.enabled)
            .field("total_events", &self.total_events)
            .field("q_table", &self.q_table)
            .finish()
    }
}

impl LearningEngine {
    /// Create an engine for `agent_id` persisting through `store`.
    pub fn new(
        agent_id: impl Into<AgentId>,
        store: Arc<MemoryStore>,
        layout: KeyLayout,
        mut config: LearningConfig,
    ) -> Self {
        let agent_id = agent_id.into();
        if config.update_frequency == 0 || config.persist_every == 0 {
            tracing::warn!(
                agent_id = %agent_id,
                update_frequency = config.update_frequency,
                persist_every = config.persist_every,
                "Zero learning intervals raised to 1"
            );
            config.update_frequency = config.update_frequency.max(1);
            config.persist_every = config.persist_every.max(1);
        }
        Self {
            ctx: OpContext::new(agent_id.clone()),
            agent_id,
            q_table: QTable::new(config.q_table_byte_budget),
            replay: ReplayBuffer::new(config.max_experiences),
            exploration_rate: config.exploration_rate,
            enabled: config.enabled,
            disabled_reason: (!config.enabled).then(|| "disabled by configuration".to_string()),
            config,
            store,
            layout,
            bus: None,
            on_persist_error: None,
            corrupt_state: false,
            total_events: 0,
            consecutive_failures: 0,
            previous_outcomes: BTreeMap::new(),
            usage: HashMap::new(),
            discovered: BTreeSet::new(),
        }
    }

    /// Publish discoveries on `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Report background persistence failures to `callback`.
    pub fn on_persist_error(mut self, callback: PersistErrorCallback) -> Self {
        self.on_persist_error = Some(callback);
        self
    }

    /// Restore persisted state.
    ///
    /// A missing state starts fresh; state from another encoding version is
    /// discarded. Unreadable state disables learning and is left untouched
    /// in the store; the error is returned for the caller to log.
    pub fn initialize(&mut self) -> SwarmResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let partition = self.layout.learning_partition(&self.agent_id);
        match self
            .store
            .retrieve_json::<PersistedState>(&self.ctx, &partition, STATE_KEY)
        {
            Ok(persisted) if persisted.value.encoding_version != ENCODING_VERSION => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    found = persisted.value.encoding_version,
                    expected = ENCODING_VERSION,
                    "Discarding learning state from another encoding version"
                );
                Ok(())
            }
            Ok(persisted) => {
                self.restore(persisted.value);
                tracing::info!(
                    agent_id = %self.agent_id,
                    entries = self.q_table.len(),
                    experiences = self.replay.len(),
                    "Restored learning state"
                );
                Ok(())
            }
            Err(SwarmError::NotFound { .. }) => Ok(()),
            Err(e @ (SwarmError::Malformed(_) | SwarmError::Serialization(_))) => {
                self.corrupt_state = true;
                self.disable(format!("corrupt persisted state: {}", e));
                Err(SwarmError::Learning(format!(
                    "corrupt learning state for '{}': {}",
                    self.agent_id, e
                )))
            }
            Err(e) => Err(e),
        }
    }

    fn restore(&mut self, state: PersistedState) {
        self.q_table = QTable::from_records(state.q_table, self.config.q_table_byte_budget);
        self.replay = ReplayBuffer::new(self.config.max_experiences);
        for experience in state.experiences {
            self.replay.push(experience);
        }
        self.exploration_rate = state
            .exploration_rate
            .clamp(self.config.min_exploration_rate, 1.0);
        self.total_events = state.total_events;
        self.previous_outcomes = state.previous_outcomes;
        self.usage = state
            .usage
            .into_iter()
            .map(|r| ((r.state, r.action), r.stats))
            .collect();
        self.discovered = state.discovered;
    }

    fn disable(&mut self, reason: String) {
        tracing::error!(agent_id = %self.agent_id, reason = %reason, "Learning disabled");
        self.enabled = false;
        self.disabled_reason = Some(reason);
    }

    /// Learn from one task execution.
    ///
    /// Returns `Ok(None)` when learning is disabled.
    pub async fn learn_from_execution(
        &mut self,
        task: &TaskDescriptor,
        outcome: &TaskOutcome,
    ) -> SwarmResult<Option<LearningUpdate>> {
        if !self.enabled {
            return Ok(None);
        }
        let previous = self
            .previous_outcomes
            .get(&task.task_type)
            .copied()
            .unwrap_or_default();
        let current = PreviousOutcome::of(outcome);
        let experience = Experience {
            state: StateFeatures::from_task(task, previous).encode(),
            action: outcome.strategy.clone(),
            reward: encoding::reward(outcome, self.config.latency_budget),
            next_state: StateFeatures::from_task(task, current).encode(),
            timestamp: self.store.clock().now(),
            agent_id: self.agent_id.clone(),
        };

        let update = self.learn_experience(experience, outcome.success).await?;
        self.previous_outcomes.insert(task.task_type.clone(), current);
        Ok(update)
    }

    /// Learn from an already-encoded transition.
    ///
    /// `success` feeds pattern statistics only; the reward drives the
    /// Q-value.
    pub async fn learn_experience(
        &mut self,
        experience: Experience,
        success: bool,
    ) -> SwarmResult<Option<LearningUpdate>> {
        if !self.enabled {
            return Ok(None);
        }

        let q_value = match self.q_table.update(
            &experience.state,
            &experience.action,
            experience.reward,
            &experience.next_state,
            self.config.learning_rate,
            self.config.discount_factor,
        ) {
            Ok(value) => value,
            Err(e) => return Err(self.record_failure(e)),
        };
        self.replay.push(experience.clone());
        self.total_events += 1;
        self.exploration_rate = (self.exploration_rate * self.config.exploration_decay)
            .max(self.config.min_exploration_rate);

        let replayed = self.total_events % self.config.update_frequency == 0;
        if replayed {
            if let Err(e) = self.replay_batch() {
                return Err(self.record_failure(e));
            }
        }
        self.consecutive_failures = 0;
        self.q_table.enforce_budget();

        let stats = {
            let stats = self
                .usage
                .entry((experience.state.clone(), experience.action.clone()))
                .or_default();
            stats.uses += 1;
            if success {
                stats.successes += 1;
            }
            *stats
        };
        let pattern = self.discover_pattern(&experience, stats).await;

        if self.total_events % self.config.persist_every == 0 {
            self.persist_in_background();
        }

        Ok(Some(LearningUpdate {
            reward: experience.reward,
            q_value,
            replayed,
            pattern,
        }))
    }

    fn replay_batch(&mut self) -> SwarmResult<()> {
        let batch = self.replay.recent(self.config.batch_size);
        self.q_table.begin_batch();
        for experience in &batch {
            if let Err(e) = self.q_table.update(
                &experience.state,
                &experience.action,
                experience.reward,
                &experience.next_state,
                self.config.learning_rate,
                self.config.discount_factor,
            ) {
                self.q_table.rollback_batch();
                return Err(e);
            }
        }
        self.q_table.commit_batch();
        tracing::trace!(agent_id = %self.agent_id, size = batch.len(), "Replayed batch");
        Ok(())
    }

    fn record_failure(&mut self, error: SwarmError) -> SwarmError {
        self.consecutive_failures += 1;
        tracing::warn!(
            agent_id = %self.agent_id,
            consecutive_failures = self.consecutive_failures,
            error = %error,
            "Learning update discarded"
        );
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            self.disable(format!(
                "{} consecutive divergent updates",
                self.consecutive_failures
            ));
        }
        error
    }

    async fn discover_pattern(&mut self, experience: &Experience, stats: UsageStats) -> Option<Pattern> {
        let success_rate = stats.success_rate();
        if stats.uses < self.config.pattern_min_usage
            || success_rate < self.config.pattern_min_success_rate
        {
            return None;
        }

        let min_usage = self.config.pattern_min_usage.max(1) as f64;
        let observation = PatternObservation {
            state: experience.state.clone(),
            action: experience.action.clone(),
            success_rate,
            usage_count: stats.uses,
            confidence: success_rate * stats.uses as f64 / (stats.uses as f64 + min_usage),
            context: self.agent_id.clone(),
        };
        let outcome = match patterns::upsert(
            &self.store,
            &self.ctx,
            &self.layout,
            &observation,
            self.config.pattern_history_limit,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(agent_id = %self.agent_id, error = %e, "Pattern upsert failed");
                return None;
            }
        };

        if self.discovered.insert(outcome.pattern.id.clone()) {
            tracing::info!(
                agent_id = %self.agent_id,
                pattern_id = %outcome.pattern.id,
                action = %outcome.pattern.action,
                "Pattern discovered"
            );
            if let Some(bus) = &self.bus {
                let event = FleetEvent::PatternDiscovered {
                    agent_id: self.agent_id.clone(),
                    pattern_id: outcome.pattern.id.clone(),
                    action: outcome.pattern.action.clone(),
                    confidence: outcome.pattern.confidence,
                };
                if let Err(e) = bus.publish(event).await {
                    tracing::warn!(error = %e, "Failed to publish pattern discovery");
                }
            }
        }
        Some(outcome.pattern)
    }

    // =========================================================================
    // Recommendations
    // =========================================================================

    /// Features of `task` given this engine's outcome history.
    pub fn features_for(&self, task: &TaskDescriptor) -> StateFeatures {
        let previous = self
            .previous_outcomes
            .get(&task.task_type)
            .copied()
            .unwrap_or_default();
        StateFeatures::from_task(task, previous)
    }

    /// Recommend the greedy strategy for a state.
    ///
    /// Returns `None` when learning is disabled or the state is unseen.
    /// Confidence grows with the best action's visits and is split between
    /// its margin over the runner-up and how many states of the same task
    /// type agree on the same action.
    pub fn recommend_strategy(&self, features: &StateFeatures) -> Option<StrategyRecommendation> {
        if !self.enabled {
            return None;
        }
        let state = features.encode();
        let ranked = self.q_table.ranked_actions(&state);
        let (best_action, best) = ranked.first()?;

        let visit_factor = best.visits as f64 / (best.visits as f64 + CONFIDENCE_VISIT_SCALE);
        let margin = match ranked.get(1) {
            Some((_, second)) => {
                let scale = best.value.abs().max(second.value.abs()).max(f64::EPSILON);
                ((best.value - second.value) / scale).clamp(0.0, 1.0)
            }
            None => 1.0,
        };

        let neighbours: Vec<&StateKey> = self
            .q_table
            .states()
            .filter(|s| *s != &state && s.task_type() == Some(features.task_type.as_str()))
            .collect();
        let consistency = if neighbours.is_empty() {
            1.0
        } else {
            let agreeing = neighbours
                .iter()
                .filter(|s| self.q_table.best_action(s).as_deref() == Some(best_action.as_str()))
                .count();
            agreeing as f64 / neighbours.len() as f64
        };

        let others = &ranked[1..];
        let expected_improvement = if others.is_empty() {
            0.0
        } else {
            let mean = others.iter().map(|(_, e)| e.value).sum::<f64>() / others.len() as f64;
            best.value - mean
        };

        Some(StrategyRecommendation {
            strategy: best_action.clone(),
            confidence: (visit_factor * (0.5 * margin + 0.5 * consistency)).clamp(0.0, 1.0),
            expected_improvement,
            alternatives: others
                .iter()
                .take(3)
                .map(|(action, entry)| StrategyAlternative {
                    strategy: action.clone(),
                    q_value: entry.value,
                })
                .collect(),
        })
    }

    /// Epsilon-greedy choice among `available` strategies.
    pub fn select_action(&self, features: &StateFeatures, available: &[String]) -> Option<String> {
        self.choose_action(&features.encode(), available, &mut rand::thread_rng())
    }

    /// Epsilon-greedy choice for an encoded state with a caller-supplied RNG.
    ///
    /// Unknown actions count as 0; ties go to the earliest in `available`.
    /// A disabled engine always exploits.
    pub fn choose_action<R: Rng + ?Sized>(
        &self,
        state: &StateKey,
        available: &[String],
        rng: &mut R,
    ) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        if self.enabled && rng.gen_bool(self.exploration_rate.clamp(0.0, 1.0)) {
            return Some(available[rng.gen_range(0..available.len())].clone());
        }
        let mut best: Option<(&String, f64)> = None;
        for action in available {
            let value = self.q_table.value(state, action);
            if best.is_none_or(|(_, v)| value > v) {
                best = Some((action, value));
            }
        }
        best.map(|(a, _)| a.clone())
    }

    // =========================================================================
    // Status and patterns
    // =========================================================================

    /// Current status.
    pub fn get_learning_status(&self) -> LearningStatus {
        LearningStatus {
            agent_id: self.agent_id.clone(),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason.clone(),
            total_experiences: self.total_events,
            buffered_experiences: self.replay.len(),
            exploration_rate: self.exploration_rate,
            pattern_count: self.discovered.len(),
            q_table_entries: self.q_table.len(),
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Every pattern in the fleet's patterns partition.
    pub fn get_learned_patterns(&self) -> SwarmResult<Vec<Pattern>> {
        patterns::list(&self.store, &self.ctx, &self.layout)
    }

    /// Whether the engine currently learns.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Owning agent.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The Q-table.
    pub fn q_table(&self) -> &QTable {
        &self.q_table
    }

    /// The replay buffer.
    pub fn replay_buffer(&self) -> &ReplayBuffer {
        &self.replay
    }

    /// Current epsilon.
    pub fn exploration_rate(&self) -> f64 {
        self.exploration_rate
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn persisted_state(&self) -> PersistedState {
        PersistedState {
            encoding_version: ENCODING_VERSION,
            exploration_rate: self.exploration_rate,
            total_events: self.total_events,
            q_table: self.q_table.records(),
            experiences: self.replay.iter().cloned().collect(),
            previous_outcomes: self.previous_outcomes.clone(),
            usage: self
                .usage
                .iter()
                .map(|((state, action), stats)| UsageRecord {
                    state: state.clone(),
                    action: action.clone(),
                    stats: *stats,
                })
                .collect(),
            discovered: self.discovered.clone(),
            saved_at: self.store.clock().now(),
        }
    }

    /// Persist state now.
    ///
    /// Does nothing while restore-time corruption is unresolved.
    pub fn persist(&self) -> SwarmResult<()> {
        if self.corrupt_state {
            return Ok(());
        }
        let version = self.store.store_json(
            &self.ctx,
            &self.layout.learning_partition(&self.agent_id),
            STATE_KEY,
            &self.persisted_state(),
            StoreOptions::new().with_acl(Acl::private(self.agent_id.clone())),
        )?;
        tracing::debug!(agent_id = %self.agent_id, version, "Persisted learning state");
        Ok(())
    }

    fn persist_in_background(&self) {
        if self.corrupt_state {
            return;
        }
        let state = self.persisted_state();
        let store = Arc::clone(&self.store);
        let ctx = self.ctx.clone();
        let partition = self.layout.learning_partition(&self.agent_id);
        let callback = self.on_persist_error.clone();

        let write = move || {
            let result = store.store_json(
                &ctx,
                &partition,
                STATE_KEY,
                &state,
                StoreOptions::new().with_acl(Acl::private(ctx.caller.clone())),
            );
            if let Err(e) = result {
                tracing::warn!(agent_id = %ctx.caller, error = %e, "Background persistence failed");
                if let Some(callback) = callback {
                    callback(&e);
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { write() });
            }
            Err(_) => write(),
        }
    }

    /// Persist final state.
    pub fn shutdown(&mut self) -> SwarmResult<()> {
        tracing::info!(agent_id = %self.agent_id, events = self.total_events, "Shutting down learning engine");
        self.persist()
    }

    /// Forget everything learned and re-enable learning.
    ///
    /// This is the explicit way to replace corrupt persisted state.
    pub fn reset(&mut self) -> SwarmResult<()> {
        self.q_table.clear();
        self.replay.clear();
        self.exploration_rate = self.config.exploration_rate;
        self.total_events = 0;
        self.consecutive_failures = 0;
        self.previous_outcomes.clear();
        self.usage.clear();
        self.discovered.clear();
        self.corrupt_state = false;
        self.enabled = self.config.enabled;
        self.disabled_reason = None;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn engine(config: LearningConfig) -> LearningEngine {
        LearningEngine::new(
            "agent-1",
            Arc::new(MemoryStore::standalone()),
            KeyLayout::new("fleet"),
            config,
        )
    }

    fn task() -> TaskDescriptor {
        TaskDescriptor::new("t1", "unit-test", 0.5)
    }

    #[tokio::test]
    async fn test_learn_updates_q_value() {
        let mut engine = engine(LearningConfig::default());
        let update = engine
            .learn_from_execution(&task(), &TaskOutcome::success("thorough", 100))
            .await
            .unwrap()
            .unwrap();
        assert!(update.reward > 0.9);
        assert!(update.q_value > 0.0);
        assert_eq!(engine.get_learning_status().total_experiences, 1);
        assert!(engine.exploration_rate() < 0.3);
    }

    #[tokio::test]
    async fn test_previous_outcome_changes_state() {
        let mut engine = engine(LearningConfig::default());
        let before = engine.features_for(&task()).encode();
        engine
            .learn_from_execution(&task(), &TaskOutcome::failure("fast", 100, "boom"))
            .await
            .unwrap();
        let after = engine.features_for(&task()).encode();
        assert_ne!(before, after);
        assert!(after.as_str().ends_with("failure"));
    }

    #[tokio::test]
    async fn test_unseen_state_has_no_recommendation() {
        let engine = engine(LearningConfig::default());
        assert!(engine.recommend_strategy(&engine.features_for(&task())).is_none());
    }

    #[tokio::test]
    async fn test_recommendation_prefers_successful_strategy() {
        let mut engine = engine(LearningConfig::default());
        let state = StateKey::new("v1|unit-test|c2|k0|medium|none");
        for _ in 0..20 {
            for (action, reward) in [("good", 1.0), ("bad", -1.0), ("meh", 0.1)] {
                engine
                    .learn_experience(
                        Experience {
                            state: state.clone(),
                            action: action.into(),
                            reward,
                            next_state: StateKey::new("terminal"),
                            timestamp: Utc::now(),
                            agent_id: "agent-1".into(),
                        },
                        reward > 0.0,
                    )
                    .await
                    .unwrap();
            }
        }
        let features = StateFeatures::from_task(&task(), PreviousOutcome::None);
        assert_eq!(features.encode(), state);

        let rec = engine.recommend_strategy(&features).unwrap();
        assert_eq!(rec.strategy, "good");
        assert!(rec.confidence > 0.5);
        assert!(rec.expected_improvement > 0.0);
        assert_eq!(rec.alternatives.len(), 2);
        assert_eq!(rec.alternatives[0].strategy, "meh");
    }

    #[tokio::test]
    async fn test_divergence_rolls_back_and_disables() {
        let mut config = LearningConfig::default();
        config.max_consecutive_failures = 2;
        let mut engine = engine(config);
        let bad = Experience {
            state: StateKey::new("s"),
            action: "a".into(),
            reward: f64::NAN,
            next_state: StateKey::new("s"),
            timestamp: Utc::now(),
            agent_id: "agent-1".into(),
        };

        let first = engine.learn_experience(bad.clone(), false).await;
        assert!(matches!(first, Err(SwarmError::Divergence { .. })));
        assert!(engine.q_table().is_empty());
        assert!(engine.replay_buffer().is_empty());
        assert!(engine.is_enabled());

        let _ = engine.learn_experience(bad.clone(), false).await;
        assert!(!engine.is_enabled());
        assert!(engine.learn_experience(bad, false).await.unwrap().is_none());
        assert!(engine.get_learning_status().disabled_reason.is_some());
    }

    #[tokio::test]
    async fn test_pattern_discovered_after_threshold() {
        let mut config = LearningConfig::default();
        config.pattern_min_usage = 3;
        let mut engine = engine(config);
        let t = TaskDescriptor::new("t", "lint", 0.1);

        // First execution moves the state from `none` to `success`, then it is stable.
        engine
            .learn_from_execution(&t, &TaskOutcome::success("fast", 10))
            .await
            .unwrap();
        let mut discovered = None;
        for _ in 0..3 {
            let update = engine
                .learn_from_execution(&t, &TaskOutcome::success("fast", 10))
                .await
                .unwrap()
                .unwrap();
            discovered = update.pattern.or(discovered);
        }
        let pattern = discovered.unwrap();
        assert_eq!(pattern.action, "fast");
        assert_eq!(engine.get_learning_status().pattern_count, 1);
        assert_eq!(engine.get_learned_patterns().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let store = Arc::new(MemoryStore::standalone());
        let mut engine = LearningEngine::new(
            "agent-1",
            Arc::clone(&store),
            KeyLayout::new("fleet"),
            LearningConfig::default(),
        );
        for _ in 0..5 {
            engine
                .learn_from_execution(&task(), &TaskOutcome::success("s", 10))
                .await
                .unwrap();
        }
        engine.shutdown().unwrap();

        let mut restored = LearningEngine::new(
            "agent-1",
            Arc::clone(&store),
            KeyLayout::new("fleet"),
            LearningConfig::default(),
        );
        restored.initialize().unwrap();
        assert_eq!(restored.q_table().len(), engine.q_table().len());
        let state = restored.features_for(&task()).encode();
        let value = restored.q_table().value(&state, "s");
        assert!((value - engine.q_table().value(&state, "s")).abs() < 1e-9);
        assert_eq!(restored.get_learning_status().total_experiences, 5);
        assert_eq!(restored.replay_buffer().len(), 5);
    }

    #[tokio::test]
    async fn test_corrupt_state_disables_without_overwrite() {
        let store = Arc::new(MemoryStore::standalone());
        let layout = KeyLayout::new("fleet");
        let ctx = OpContext::new("agent-1");
        store
            .store(
                &ctx,
                &layout.learning_partition("agent-1"),
                STATE_KEY,
                b"{\"q_table\": [[[[".to_vec(),
                StoreOptions::new(),
            )
            .unwrap();

        let mut engine = LearningEngine::new(
            "agent-1",
            Arc::clone(&store),
            layout.clone(),
            LearningConfig::default(),
        );
        assert!(matches!(engine.initialize(), Err(SwarmError::Learning(_))));
        assert!(!engine.is_enabled());
        engine.shutdown().unwrap();

        let raw = store
            .retrieve(&ctx, &layout.learning_partition("agent-1"), STATE_KEY)
            .unwrap();
        assert_eq!(raw.version, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_state() {
        let mut engine = engine(LearningConfig::default());
        engine
            .learn_from_execution(&task(), &TaskOutcome::success("s", 10))
            .await
            .unwrap();
        engine.reset().unwrap();
        let status = engine.get_learning_status();
        assert_eq!(status.total_experiences, 0);
        assert_eq!(status.q_table_entries, 0);
        assert!(status.enabled);
    }

    #[test]
    fn test_choose_action_exploits_when_greedy() {
        let mut config = LearningConfig::default();
        config.exploration_rate = 0.0;
        config.min_exploration_rate = 0.0;
        let engine = engine(config);
        let mut rng = StdRng::seed_from_u64(7);
        let available = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            engine.choose_action(&StateKey::new("s"), &available, &mut rng),
            Some("a".to_string())
        );
        assert_eq!(engine.choose_action(&StateKey::new("s"), &[], &mut rng), None);
    }

    #[tokio::test]
    async fn test_zero_intervals_do_not_panic() {
        let mut config = LearningConfig::default();
        config.update_frequency = 0;
        config.persist_every = 0;
        let mut engine = engine(config);
        for _ in 0..2 {
            let update = engine
                .learn_from_execution(&task(), &TaskOutcome::success("s", 10))
                .await
                .unwrap()
                .unwrap();
            assert!(update.replayed);
        }
    }

    #[test]
    fn test_disabled_by_config() {
        let mut config = LearningConfig::default();
        config.enabled = false;
        let engine = engine(config);
        assert!(!engine.get_learning_status().enabled);
    }
}
