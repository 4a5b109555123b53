//! Improvement loop: regressions in, A/B tests out.
//!
//! A cycle looks for metrics that regressed since the baseline, and for each
//! regressed metric without a running test opens an A/B test pitting the
//! current behaviour against the strongest learned patterns. Results are
//! accumulated per arm; once every arm holds `samples_per_arm` results the
//! test completes and a winner is chosen by success rate, ties going to the
//! lower mean latency.
//!
//! Winner confidence is `1 - p` of a two-sided two-proportion z-test against
//! the runner-up. Only confident, adequately sampled winners are applied
//! automatically; everything else waits for an operator.
use crate::bus::{EventBus, FleetEvent};
use crate::config::ImprovementConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::layout::KeyLayout;
use crate::learning::patterns::{self, Pattern};
use crate::performance::{PerformanceTracker, Regression};
use crate::storage::MemoryStore;
use crate::types::{OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Name of the arm that keeps current behaviour.
pub const BASELINE_ARM: &str = "baseline";

/// A/B test lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    /// Collecting results
    Running,
    /// Every arm is full
    Completed,
}

/// One strategy under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestArm {
    /// Arm name, unique within the test
    pub name: String,
    /// Strategy configuration handed to agents
    pub config: JsonValue,
    /// Learned pattern behind the arm
    pub pattern_id: Option<String>,
}

impl TestArm {
    /// Arm without a pattern.
    pub fn new(name: impl Into<String>, config: JsonValue) -> Self {
        Self {
            name: name.into(),
            config,
            pattern_id: None,
        }
    }

    /// Arm trying a learned pattern.
    pub fn from_pattern(pattern: &Pattern) -> Self {
        Self {
            name: pattern.action.clone(),
            config: json!({ "strategy": pattern.action, "state": pattern.state }),
            pattern_id: Some(pattern.id.clone()),
        }
    }
}

/// Accumulated results of one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmResults {
    /// Successful trials
    pub successes: u64,
    /// Failed trials
    pub failures: u64,
    /// Sum of trial latencies
    pub total_latency_ms: u64,
}

impl ArmResults {
    /// Trials recorded.
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// `successes / total`, zero when empty.
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.successes as f64 / n as f64,
        }
    }

    /// Mean latency, zero when empty.
    pub fn mean_latency_ms(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.total_latency_ms as f64 / n as f64,
        }
    }
}

/// An A/B comparison of strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ABTest {
    /// Test ID
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Failure category (a metric name) the test addresses
    pub category: String,
    /// Arms in creation order
    pub arms: Vec<TestArm>,
    /// Results needed per arm
    pub samples_per_arm: u32,
    /// Results per arm name
    pub results: BTreeMap<String, ArmResults>,
    /// Lifecycle
    pub state: TestState,
    /// Winning arm once completed
    pub winner: Option<String>,
    /// Winner confidence once completed
    pub confidence: Option<f64>,
    /// Sample size below the configured minimum
    pub low_confidence: bool,
    /// Winner has been applied
    pub applied: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub completed_at: Option<DateTime<Utc>>,
}

impl ABTest {
    /// Arm named `name`.
    pub fn arm(&self, name: &str) -> Option<&TestArm> {
        self.arms.iter().find(|a| a.name == name)
    }

    /// Results of arm `name`.
    pub fn results_for(&self, name: &str) -> ArmResults {
        self.results.get(name).copied().unwrap_or_default()
    }

    fn is_full(&self) -> bool {
        self.arms
            .iter()
            .all(|arm| self.results_for(&arm.name).total() >= u64::from(self.samples_per_arm))
    }

    /// Rank arms and record winner and confidence.
    fn complete(&mut self, now: DateTime<Utc>) {
        let mut ranked: Vec<(&str, ArmResults)> = self
            .arms
            .iter()
            .map(|arm| (arm.name.as_str(), self.results_for(&arm.name)))
            .collect();
        // Stable sort keeps creation order for exact ties.
        ranked.sort_by(|(_, a), (_, b)| {
            b.success_rate()
                .total_cmp(&a.success_rate())
                .then_with(|| a.mean_latency_ms().total_cmp(&b.mean_latency_ms()))
        });

        let confidence = match (ranked.first(), ranked.get(1)) {
            (Some((_, best)), Some((_, second))) => two_proportion_confidence(best, second),
            _ => 0.0,
        };
        self.winner = ranked.first().map(|(name, _)| name.to_string());
        self.confidence = Some(confidence);
        self.state = TestState::Completed;
        self.completed_at = Some(now);
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Regressions found
    pub regressions: Vec<Regression>,
    /// Patterns above the confidence floor
    pub candidate_patterns: usize,
    /// Tests opened this cycle
    pub tests_created: Vec<String>,
    /// Tests applied this cycle
    pub tests_applied: Vec<String>,
    /// Tests still collecting results
    pub running_tests: usize,
}

/// Runs improvement cycles for one agent.
#[derive(Debug, Clone)]
pub struct ImprovementLoop {
    store: Arc<MemoryStore>,
    layout: KeyLayout,
    partition: String,
    tracker: PerformanceTracker,
    config: ImprovementConfig,
    pattern_history: usize,
    bus: Option<Arc<dyn EventBus>>,
}

impl ImprovementLoop {
    /// Loop driven by `tracker`'s regressions.
    ///
    /// `pattern_history_limit` bounds pattern history when an applied winner
    /// bumps its pattern's usage, and must match the learning engines'.
    pub fn new(
        store: Arc<MemoryStore>,
        layout: &KeyLayout,
        tracker: PerformanceTracker,
        config: ImprovementConfig,
        pattern_history_limit: usize,
    ) -> Self {
        Self {
            store,
            layout: layout.clone(),
            partition: layout.improvement_partition(),
            tracker,
            config,
            pattern_history: pattern_history_limit,
            bus: None,
        }
    }

    /// Publish applied improvements on `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// History bound used when bumping pattern usage.
    pub fn pattern_history_limit(&self) -> usize {
        self.pattern_history
    }

    /// Open an A/B test.
    ///
    /// Needs at least two arms with distinct names. `samples_per_arm`
    /// defaults to the configured value; small samples are accepted and
    /// flagged `low_confidence`.
    pub fn create_ab_test(
        &self,
        ctx: &OpContext,
        name: &str,
        category: &str,
        arms: Vec<TestArm>,
        samples_per_arm: Option<u32>,
    ) -> SwarmResult<ABTest> {
        if arms.len() < 2 {
            return Err(SwarmError::invalid("an A/B test needs at least two arms"));
        }
        let mut names = HashSet::new();
        if let Some(dup) = arms.iter().find(|a| !names.insert(a.name.as_str())) {
            return Err(SwarmError::invalid(format!("duplicate arm '{}'", dup.name)));
        }
        let samples_per_arm = samples_per_arm.unwrap_or(self.config.samples_per_arm);
        if samples_per_arm == 0 {
            return Err(SwarmError::invalid("samples_per_arm must be greater than zero"));
        }

        let test = ABTest {
            id: format!("ab-{}", Uuid::new_v4()),
            name: name.to_string(),
            category: category.to_string(),
            results: arms.iter().map(|a| (a.name.clone(), ArmResults::default())).collect(),
            arms,
            samples_per_arm,
            state: TestState::Running,
            winner: None,
            confidence: None,
            low_confidence: samples_per_arm < self.config.min_samples_per_arm,
            applied: false,
            created_at: self.store.clock().now(),
            completed_at: None,
        };
        self.store.store_json(
            ctx,
            &self.partition,
            &test.id,
            &test,
            StoreOptions::new().with_expected_version(0),
        )?;
        tracing::info!(
            test_id = %test.id,
            category,
            arms = test.arms.len(),
            samples_per_arm,
            low_confidence = test.low_confidence,
            "A/B test created"
        );
        Ok(test)
    }

    /// Record one trial of `arm`.
    ///
    /// Fails with `InvalidData` for unknown arms, full arms, and completed
    /// tests. The trial that fills the last arm completes the test and, when
    /// auto-apply allows, applies the winner.
    pub async fn record_test_result(
        &self,
        ctx: &OpContext,
        test_id: &str,
        arm: &str,
        success: bool,
        latency_ms: u64,
    ) -> SwarmResult<ABTest> {
        let now = self.store.clock().now();
        let mut completed = false;
        let updated = self.store.update_json::<ABTest, _>(
            ctx,
            &self.partition,
            test_id,
            StoreOptions::new(),
            |current| {
                completed = false;
                let mut test = current.ok_or_else(|| SwarmError::NotFound {
                    partition: self.partition.clone(),
                    key: test_id.to_string(),
                })?;
                if test.state == TestState::Completed {
                    return Err(SwarmError::invalid(format!("test {} already completed", test_id)));
                }
                if test.arm(arm).is_none() {
                    return Err(SwarmError::invalid(format!("test {} has no arm '{}'", test_id, arm)));
                }
                let results = test.results.entry(arm.to_string()).or_default();
                if results.total() >= u64::from(test.samples_per_arm) {
                    return Err(SwarmError::invalid(format!(
                        "arm '{}' of test {} already holds {} samples",
                        arm, test_id, test.samples_per_arm
                    )));
                }
                if success {
                    results.successes += 1;
                } else {
                    results.failures += 1;
                }
                results.total_latency_ms = results.total_latency_ms.saturating_add(latency_ms);

                if test.is_full() {
                    test.complete(now);
                    completed = true;
                }
                Ok(test)
            },
        )?;
        let test = updated.value;

        if completed {
            tracing::info!(
                test_id,
                winner = test.winner.as_deref().unwrap_or(""),
                confidence = test.confidence.unwrap_or(0.0),
                "A/B test completed"
            );
            if self.should_auto_apply(&test) {
                return self.apply_winner(ctx, test_id).await;
            }
        }
        Ok(test)
    }

    /// Mark a completed test's winner applied, publish it and bump the
    /// winning pattern's usage.
    ///
    /// Applying twice is a no-op. This path ignores the auto-apply threshold
    /// so an operator can apply a reviewed result.
    pub async fn apply_winner(&self, ctx: &OpContext, test_id: &str) -> SwarmResult<ABTest> {
        let mut newly_applied = false;
        let updated = self.store.update_json::<ABTest, _>(
            ctx,
            &self.partition,
            test_id,
            StoreOptions::new(),
            |current| {
                newly_applied = false;
                let mut test = current.ok_or_else(|| SwarmError::NotFound {
                    partition: self.partition.clone(),
                    key: test_id.to_string(),
                })?;
                if test.state != TestState::Completed || test.winner.is_none() {
                    return Err(SwarmError::invalid(format!("test {} has no winner yet", test_id)));
                }
                if !test.applied {
                    test.applied = true;
                    newly_applied = true;
                }
                Ok(test)
            },
        )?;
        let test = updated.value;
        if !newly_applied {
            return Ok(test);
        }

        let Some(winner) = test.winner.clone() else {
            return Ok(test);
        };
        let pattern_id = test.arm(&winner).and_then(|a| a.pattern_id.clone());
        if let Some(id) = &pattern_id {
            match patterns::record_usage(&self.store, ctx, &self.layout, id, self.pattern_history) {
                Ok(p) => tracing::debug!(pattern_id = %id, usage_count = p.usage_count, "Pattern usage bumped"),
                Err(e) => tracing::warn!(pattern_id = %id, error = %e, "Failed to bump pattern usage"),
            }
        }

        tracing::info!(test_id, arm = %winner, "Improvement applied");
        if let Some(bus) = &self.bus {
            let event = FleetEvent::ImprovementApplied {
                test_id: test.id.clone(),
                category: test.category.clone(),
                arm: winner,
                confidence: test.confidence.unwrap_or(0.0),
                pattern_id,
            };
            if let Err(e) = bus.publish(event).await {
                tracing::warn!(error = %e, "Failed to publish improvement");
            }
        }
        Ok(test)
    }

    /// Fetch one test.
    pub fn get_test(&self, ctx: &OpContext, test_id: &str) -> SwarmResult<ABTest> {
        Ok(self
            .store
            .retrieve_json::<ABTest>(ctx, &self.partition, test_id)?
            .value)
    }

    /// Every readable test, in ID order.
    pub fn list_tests(&self, ctx: &OpContext) -> SwarmResult<Vec<ABTest>> {
        let mut tests = Vec::new();
        for entry in self.store.query(ctx, &self.partition, |_| true)? {
            match self.store.decoder().decode::<ABTest>(&entry.value) {
                Ok(test) => tests.push(test),
                Err(e) => tracing::warn!(key = %entry.key, error = %e, "Skipping undecodable test"),
            }
        }
        Ok(tests)
    }

    /// One pass: detect regressions, open tests, apply ready winners.
    pub async fn run_improvement_cycle(&self, ctx: &OpContext) -> SwarmResult<CycleReport> {
        let regressions = self
            .tracker
            .detect_regressions(ctx, self.config.regression_tolerance)?;
        let candidates: Vec<Pattern> = patterns::list(&self.store, ctx, &self.layout)?
            .into_iter()
            .filter(|p| p.confidence >= self.config.pattern_confidence_floor)
            .collect();
        let tests = self.list_tests(ctx)?;
        let mut busy: HashSet<String> = tests
            .iter()
            .filter(|t| t.state == TestState::Running)
            .map(|t| t.category.clone())
            .collect();

        let mut report = CycleReport {
            candidate_patterns: candidates.len(),
            running_tests: busy.len(),
            ..CycleReport::default()
        };

        for regression in &regressions {
            let category = regression.metric.to_string();
            if busy.contains(&category) {
                continue;
            }
            let arms = self.arms_for(&candidates);
            if arms.len() < 2 {
                tracing::debug!(%category, "No candidate strategies for regression");
                continue;
            }
            let name = format!("{} regression", category);
            let test = self.create_ab_test(ctx, &name, &category, arms, None)?;
            report.tests_created.push(test.id);
            report.running_tests += 1;
            busy.insert(category);
        }

        for test in tests
            .iter()
            .filter(|t| t.state == TestState::Completed && !t.applied)
        {
            if self.should_auto_apply(test) {
                let applied = self.apply_winner(ctx, &test.id).await?;
                report.tests_applied.push(applied.id);
            }
        }

        report.regressions = regressions;
        tracing::info!(
            agent_id = %self.tracker.agent_id(),
            regressions = report.regressions.len(),
            created = report.tests_created.len(),
            applied = report.tests_applied.len(),
            "Improvement cycle complete"
        );
        Ok(report)
    }

    fn arms_for(&self, candidates: &[Pattern]) -> Vec<TestArm> {
        let mut arms = vec![TestArm::new(BASELINE_ARM, json!({ "strategy": "current" }))];
        for pattern in candidates {
            if arms.len() > self.config.max_candidate_arms {
                break;
            }
            if arms.iter().all(|a| a.name != pattern.action) {
                arms.push(TestArm::from_pattern(pattern));
            }
        }
        arms
    }

    fn should_auto_apply(&self, test: &ABTest) -> bool {
        self.config.auto_apply
            && !test.low_confidence
            && test.winner.as_deref().is_some_and(|w| w != BASELINE_ARM)
            && test
                .confidence
                .is_some_and(|c| c >= self.config.confidence_threshold)
    }
}

/// `1 - p` of a two-sided two-proportion z-test.
fn two_proportion_confidence(a: &ArmResults, b: &ArmResults) -> f64 {
    let (n1, n2) = (a.total() as f64, b.total() as f64);
    if n1 == 0.0 || n2 == 0.0 {
        return 0.0;
    }
    let pooled = (a.successes + b.successes) as f64 / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if se == 0.0 {
        return 0.0;
    }
    let z = (a.success_rate() - b.success_rate()) / se;
    erf(z.abs() / std::f64::consts::SQRT_2)
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    if x == 0.0 {
        return 0.0;
    }
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::clock::ManualClock;
    use crate::config::{LearningConfig, PerformanceConfig, StoreConfig};
    use crate::learning::StateKey;
    use crate::learning::patterns::PatternObservation;
    use crate::performance::PerformanceMetrics;
    use crate::registry::InMemoryAgentRegistry;
    use chrono::Duration as ChronoDuration;
    use futures::StreamExt;

    struct Fixture {
        store: Arc<MemoryStore>,
        layout: KeyLayout,
        clock: ManualClock,
        tracker: PerformanceTracker,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::new(
            Arc::new(InMemoryAgentRegistry::new()),
            Arc::new(clock.clone()),
            &StoreConfig::default(),
        ));
        let layout = KeyLayout::new("fleet");
        let tracker = PerformanceTracker::new(
            "agent-1",
            Arc::clone(&store),
            &layout,
            PerformanceConfig::default(),
        );
        Fixture {
            store,
            layout,
            clock,
            tracker,
        }
    }

    fn looper(f: &Fixture, config: ImprovementConfig) -> ImprovementLoop {
        ImprovementLoop::new(
            Arc::clone(&f.store),
            &f.layout,
            f.tracker.clone(),
            config,
            LearningConfig::default().pattern_history_limit,
        )
    }

    fn two_arms() -> Vec<TestArm> {
        vec![
            TestArm::new("a", json!({"strategy": "a"})),
            TestArm::new("b", json!({"strategy": "b"})),
        ]
    }

    fn ctx() -> OpContext {
        OpContext::new("agent-1")
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
        // 1.96 standard deviations is the 95% two-sided interval
        assert!((erf(1.96 / std::f64::consts::SQRT_2) - 0.95).abs() < 1e-3);
    }

    #[test]
    fn test_create_requires_two_distinct_arms() {
        let f = fixture();
        let lp = looper(&f, ImprovementConfig::default());
        let one = vec![TestArm::new("a", json!(null))];
        assert!(matches!(
            lp.create_ab_test(&ctx(), "t", "error_rate", one, None),
            Err(SwarmError::InvalidData { .. })
        ));
        let dup = vec![TestArm::new("a", json!(null)), TestArm::new("a", json!(null))];
        assert!(matches!(
            lp.create_ab_test(&ctx(), "t", "error_rate", dup, None),
            Err(SwarmError::InvalidData { .. })
        ));
    }

    #[tokio::test]
    async fn test_completes_when_every_arm_is_full() {
        let f = fixture();
        let lp = looper(&f, ImprovementConfig::default());
        let test = lp
            .create_ab_test(&ctx(), "t", "error_rate", two_arms(), Some(10))
            .unwrap();
        assert!(test.low_confidence);

        for i in 0..10 {
            let t = lp.record_test_result(&ctx(), &test.id, "a", i < 8, 100).await.unwrap();
            assert_eq!(t.state, TestState::Running);
        }
        for i in 0..9 {
            let t = lp.record_test_result(&ctx(), &test.id, "b", i < 5, 50).await.unwrap();
            assert_eq!(t.state, TestState::Running);
        }
        let done = lp.record_test_result(&ctx(), &test.id, "b", false, 50).await.unwrap();
        assert_eq!(done.state, TestState::Completed);
        assert_eq!(done.winner.as_deref(), Some("a"));
        assert!(done.confidence.unwrap() > 0.0);
        assert!(!done.applied);

        assert!(matches!(
            lp.record_test_result(&ctx(), &test.id, "a", true, 1).await,
            Err(SwarmError::InvalidData { .. })
        ));
    }

    #[tokio::test]
    async fn test_saturated_arm_rejected() {
        let f = fixture();
        let lp = looper(&f, ImprovementConfig::default());
        let test = lp
            .create_ab_test(&ctx(), "t", "error_rate", two_arms(), Some(2))
            .unwrap();
        lp.record_test_result(&ctx(), &test.id, "a", true, 10).await.unwrap();
        lp.record_test_result(&ctx(), &test.id, "a", true, 10).await.unwrap();
        assert!(matches!(
            lp.record_test_result(&ctx(), &test.id, "a", true, 10).await,
            Err(SwarmError::InvalidData { .. })
        ));
        assert!(matches!(
            lp.record_test_result(&ctx(), &test.id, "zzz", true, 10).await,
            Err(SwarmError::InvalidData { .. })
        ));
        assert_eq!(lp.get_test(&ctx(), &test.id).unwrap().results_for("a").total(), 2);
    }

    #[tokio::test]
    async fn test_tie_broken_by_latency() {
        let f = fixture();
        let lp = looper(&f, ImprovementConfig::default());
        let test = lp
            .create_ab_test(&ctx(), "t", "error_rate", two_arms(), Some(2))
            .unwrap();
        lp.record_test_result(&ctx(), &test.id, "a", true, 200).await.unwrap();
        lp.record_test_result(&ctx(), &test.id, "a", false, 200).await.unwrap();
        lp.record_test_result(&ctx(), &test.id, "b", true, 20).await.unwrap();
        let done = lp.record_test_result(&ctx(), &test.id, "b", false, 20).await.unwrap();
        assert_eq!(done.winner.as_deref(), Some("b"));
        assert!(done.confidence.unwrap() < 1e-6);
    }

    #[tokio::test]
    async fn test_auto_apply_publishes_and_bumps_usage() {
        let f = fixture();
        let observation = PatternObservation {
            state: StateKey::new("v1|deploy|c2|k1|high|none"),
            action: "canary".to_string(),
            success_rate: 0.9,
            usage_count: 12,
            confidence: 0.9,
            context: "agent-1".to_string(),
        };
        let pattern = patterns::upsert(&f.store, &ctx(), &f.layout, &observation, 8)
            .unwrap()
            .pattern;

        let bus = Arc::new(InMemoryEventBus::new(8));
        let mut events = bus.subscribe();
        let config = ImprovementConfig {
            auto_apply: true,
            confidence_threshold: 0.9,
            min_samples_per_arm: 20,
            ..ImprovementConfig::default()
        };
        let lp = looper(&f, config).with_bus(bus.clone());
        let arms = vec![
            TestArm::new(BASELINE_ARM, json!({"strategy": "current"})),
            TestArm::from_pattern(&pattern),
        ];
        let test = lp.create_ab_test(&ctx(), "t", "error_rate", arms, Some(20)).unwrap();
        assert!(!test.low_confidence);

        for i in 0..20 {
            lp.record_test_result(&ctx(), &test.id, BASELINE_ARM, i < 6, 100).await.unwrap();
        }
        let mut last = None;
        for i in 0..20 {
            last = Some(lp.record_test_result(&ctx(), &test.id, "canary", i < 19, 100).await.unwrap());
        }
        let done = last.unwrap();
        assert!(done.applied);
        assert_eq!(done.winner.as_deref(), Some("canary"));

        match events.next().await.unwrap() {
            FleetEvent::ImprovementApplied { test_id, arm, pattern_id, .. } => {
                assert_eq!(test_id, test.id);
                assert_eq!(arm, "canary");
                assert_eq!(pattern_id.as_deref(), Some(pattern.id.as_str()));
            }
            other => panic!("unexpected event {:?}", other),
        }
        let doc = patterns::get(&f.store, &ctx(), &f.layout, &pattern.id).unwrap();
        assert_eq!(doc.current.usage_count, pattern.usage_count + 1);

        // Applying again changes nothing.
        let again = lp.apply_winner(&ctx(), &test.id).await.unwrap();
        assert!(again.applied);
        let doc = patterns::get(&f.store, &ctx(), &f.layout, &pattern.id).unwrap();
        assert_eq!(doc.current.usage_count, pattern.usage_count + 1);
    }

    #[tokio::test]
    async fn test_low_confidence_never_auto_applied() {
        let f = fixture();
        let config = ImprovementConfig {
            auto_apply: true,
            confidence_threshold: 0.0,
            ..ImprovementConfig::default()
        };
        let lp = looper(&f, config);
        let test = lp
            .create_ab_test(&ctx(), "t", "error_rate", two_arms(), Some(1))
            .unwrap();
        lp.record_test_result(&ctx(), &test.id, "a", false, 1).await.unwrap();
        let done = lp.record_test_result(&ctx(), &test.id, "b", true, 1).await.unwrap();
        assert_eq!(done.state, TestState::Completed);
        assert!(done.low_confidence);
        assert!(!done.applied);
    }

    #[tokio::test]
    async fn test_cycle_opens_one_test_per_regressed_metric() {
        let f = fixture();
        let observation = PatternObservation {
            state: StateKey::new("v1|build|c1|k0|medium|failure"),
            action: "retry_with_cache".to_string(),
            success_rate: 0.95,
            usage_count: 20,
            confidence: 0.8,
            context: "agent-2".to_string(),
        };
        patterns::upsert(&f.store, &ctx(), &f.layout, &observation, 8).unwrap();

        let base = PerformanceMetrics {
            tasks_completed: 10,
            success_rate: 0.9,
            avg_execution_time_ms: 100.0,
            error_rate: 0.1,
            user_satisfaction: 0.8,
            resource_efficiency: 0.8,
        };
        f.tracker.record_snapshot(&ctx(), base).unwrap();
        f.clock.advance(ChronoDuration::days(1));
        f.tracker
            .record_snapshot(&ctx(), PerformanceMetrics { error_rate: 0.3, ..base })
            .unwrap();

        let lp = looper(&f, ImprovementConfig::default());
        let report = lp.run_improvement_cycle(&ctx()).await.unwrap();
        assert_eq!(report.regressions.len(), 1);
        assert_eq!(report.candidate_patterns, 1);
        assert_eq!(report.tests_created.len(), 1);

        let test = lp.get_test(&ctx(), &report.tests_created[0]).unwrap();
        assert_eq!(test.category, "error_rate");
        assert_eq!(test.arms.len(), 2);
        assert_eq!(test.arms[0].name, BASELINE_ARM);

        let again = lp.run_improvement_cycle(&ctx()).await.unwrap();
        assert!(again.tests_created.is_empty());
        assert_eq!(again.running_tests, 1);
    }
}
