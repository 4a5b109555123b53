//! Per-agent performance tracking.
//!
//! Snapshots of an agent's metrics are stored in its learning partition
//! under `snapshots/{timestamp}-{seq}`. Improvement is measured against a baseline,
//! either set explicitly or the earliest snapshot still inside the retention
//! window, and summarized as a weighted aggregate score.
use crate::config::PerformanceConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::layout::{
    BASELINE_KEY, KeyLayout, SNAPSHOT_PREFIX, SNAPSHOT_SEQ_LIMIT, parse_snapshot_key, snapshot_key,
};
use crate::storage::MemoryStore;
use crate::types::{Acl, AgentId, OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Metrics captured in one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Tasks completed since the previous snapshot
    pub tasks_completed: u64,
    /// Fraction of tasks that succeeded
    pub success_rate: f64,
    /// Mean execution time in milliseconds
    pub avg_execution_time_ms: f64,
    /// Fraction of tasks that errored
    pub error_rate: f64,
    /// Mean user satisfaction in `[0, 1]`
    pub user_satisfaction: f64,
    /// Resource efficiency in `[0, 1]`
    pub resource_efficiency: f64,
}

impl PerformanceMetrics {
    /// Rates clamped to `[0, 1]`, time to `>= 0`, non-finite values to zero.
    pub fn clamped(self) -> Self {
        fn unit(v: f64) -> f64 {
            if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 }
        }
        Self {
            tasks_completed: self.tasks_completed,
            success_rate: unit(self.success_rate),
            avg_execution_time_ms: if self.avg_execution_time_ms.is_finite() {
                self.avg_execution_time_ms.max(0.0)
            } else {
                0.0
            },
            error_rate: unit(self.error_rate),
            user_satisfaction: unit(self.user_satisfaction),
            resource_efficiency: unit(self.resource_efficiency),
        }
    }
}

/// A metric that contributes to the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `success_rate`
    SuccessRate,
    /// `avg_execution_time_ms`
    AvgExecutionTime,
    /// `error_rate`
    ErrorRate,
    /// `user_satisfaction`
    UserSatisfaction,
    /// `resource_efficiency`
    ResourceEfficiency,
}

impl Metric {
    /// Every scored metric.
    pub const ALL: [Metric; 5] = [
        Metric::SuccessRate,
        Metric::AvgExecutionTime,
        Metric::ErrorRate,
        Metric::UserSatisfaction,
        Metric::ResourceEfficiency,
    ];

    /// Weight in the aggregate score.
    pub fn weight(self) -> f64 {
        match self {
            Metric::SuccessRate => 0.30,
            Metric::AvgExecutionTime => 0.20,
            Metric::ErrorRate => 0.20,
            Metric::UserSatisfaction => 0.15,
            Metric::ResourceEfficiency => 0.15,
        }
    }

    /// Whether smaller values are improvements.
    pub fn lower_is_better(self) -> bool {
        matches!(self, Metric::AvgExecutionTime | Metric::ErrorRate)
    }

    /// Value of this metric in `metrics`.
    pub fn value(self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            Metric::SuccessRate => metrics.success_rate,
            Metric::AvgExecutionTime => metrics.avg_execution_time_ms,
            Metric::ErrorRate => metrics.error_rate,
            Metric::UserSatisfaction => metrics.user_satisfaction,
            Metric::ResourceEfficiency => metrics.resource_efficiency,
        }
    }

    /// Relative improvement from `baseline` to `current`.
    ///
    /// `None` when the baseline is zero.
    pub fn improvement_rate(self, baseline: f64, current: f64) -> Option<f64> {
        if baseline == 0.0 {
            return None;
        }
        let delta = if self.lower_is_better() {
            baseline - current
        } else {
            current - baseline
        };
        Some(delta / baseline)
    }

    /// How much worse `current` is than `baseline`, positive when worse.
    ///
    /// Relative to the baseline when it is non-zero. A zero baseline of a
    /// lower-is-better metric uses the absolute increase instead.
    pub fn degradation(self, baseline: f64, current: f64) -> f64 {
        match self.improvement_rate(baseline, current) {
            Some(rate) => -rate,
            None if self.lower_is_better() => current - baseline,
            None => baseline - current,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::SuccessRate => "success_rate",
            Metric::AvgExecutionTime => "avg_execution_time_ms",
            Metric::ErrorRate => "error_rate",
            Metric::UserSatisfaction => "user_satisfaction",
            Metric::ResourceEfficiency => "resource_efficiency",
        };
        f.write_str(name)
    }
}

/// One recorded snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Agent the metrics belong to
    pub agent_id: AgentId,
    /// When it was taken
    pub timestamp: DateTime<Utc>,
    /// The metrics
    pub metrics: PerformanceMetrics,
}

/// Improvement of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricImprovement {
    /// Which metric
    pub metric: Metric,
    /// Baseline value
    pub baseline: f64,
    /// Current value
    pub current: f64,
    /// Relative improvement, positive is better
    pub improvement_rate: f64,
}

/// Result of comparing the latest snapshot against the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementSummary {
    /// Baseline snapshot time
    pub baseline_at: DateTime<Utc>,
    /// Latest snapshot time
    pub current_at: DateTime<Utc>,
    /// Metrics with a non-zero baseline
    pub metrics: Vec<MetricImprovement>,
    /// Weighted mean of the per-metric rates
    pub aggregate: f64,
    /// Configured target
    pub target: f64,
    /// Whether the target was met inside the horizon
    pub target_achieved: bool,
    /// Days between baseline and latest snapshot
    pub elapsed_days: f64,
}

impl ImprovementSummary {
    fn metric(&self, metric: Metric) -> Option<&MetricImprovement> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}

/// A point on the improvement timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
    /// Aggregate score against the baseline
    pub score: f64,
}

/// Timeline of aggregate scores plus a least-squares projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementTrend {
    /// Points in time order
    pub points: Vec<TrendPoint>,
    /// Fitted change of the score per day
    pub slope_per_day: f64,
    /// Projection target time (baseline + horizon)
    pub projected_at: Option<DateTime<Utc>>,
    /// Fitted score at `projected_at`; needs two points
    pub projected_score: Option<f64>,
}

/// A metric that degraded past the tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    /// Which metric
    pub metric: Metric,
    /// Baseline value
    pub baseline: f64,
    /// Current value
    pub current: f64,
    /// Degradation, positive; absolute when the baseline is zero
    pub degradation: f64,
}

/// Summary block of a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Snapshots inside the retention window
    pub snapshot_count: usize,
    /// First snapshot time
    pub first_at: Option<DateTime<Utc>>,
    /// Latest snapshot time
    pub last_at: Option<DateTime<Utc>>,
    /// Latest metrics
    pub latest: Option<PerformanceMetrics>,
}

/// Everything the tracker knows about an agent, with recommendations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Agent
    pub agent_id: AgentId,
    /// Report time
    pub generated_at: DateTime<Utc>,
    /// Summary
    pub summary: ReportSummary,
    /// Improvement against the baseline
    pub improvement: Option<ImprovementSummary>,
    /// Trend over the horizon
    pub trend: ImprovementTrend,
    /// Degraded metrics
    pub regressions: Vec<Regression>,
    /// Human-readable suggestions
    pub recommendations: Vec<String>,
}

/// Tracks one agent's performance over time.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    agent_id: AgentId,
    store: Arc<MemoryStore>,
    partition: String,
    config: PerformanceConfig,
}

impl PerformanceTracker {
    /// Tracker for `agent_id`.
    pub fn new(
        agent_id: impl Into<AgentId>,
        store: Arc<MemoryStore>,
        layout: &KeyLayout,
        config: PerformanceConfig,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            partition: layout.learning_partition(&agent_id),
            agent_id,
            store,
            config,
        }
    }

    /// Agent this tracker belongs to.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Record `metrics` as of now.
    pub fn record_snapshot(
        &self,
        ctx: &OpContext,
        metrics: PerformanceMetrics,
    ) -> SwarmResult<PerformanceSnapshot> {
        let now = self.store.clock().now();
        self.record_snapshot_at(ctx, metrics, now)
    }

    /// Record `metrics` as of `timestamp`.
    ///
    /// Snapshots are never overwritten: each one is created under a fresh
    /// key. Snapshots that have fallen out of the retention window are
    /// deleted afterwards.
    pub fn record_snapshot_at(
        &self,
        ctx: &OpContext,
        metrics: PerformanceMetrics,
        timestamp: DateTime<Utc>,
    ) -> SwarmResult<PerformanceSnapshot> {
        let snapshot = PerformanceSnapshot {
            agent_id: self.agent_id.clone(),
            timestamp,
            metrics: metrics.clamped(),
        };
        let opts = StoreOptions::new()
            .with_acl(Acl::team(self.agent_id.clone()))
            .with_expected_version(0);

        let mut recorded = false;
        for seq in 0..SNAPSHOT_SEQ_LIMIT {
            let key = snapshot_key(timestamp, seq);
            match self
                .store
                .store_json(ctx, &self.partition, &key, &snapshot, opts.clone())
            {
                Ok(_) => {
                    recorded = true;
                    break;
                }
                Err(SwarmError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if !recorded {
            return Err(SwarmError::invalid(format!(
                "more than {} snapshots at {}",
                SNAPSHOT_SEQ_LIMIT, timestamp
            )));
        }
        tracing::debug!(agent_id = %self.agent_id, %timestamp, "Performance snapshot recorded");

        if let Err(e) = self.prune_expired_snapshots(ctx) {
            tracing::warn!(agent_id = %self.agent_id, error = %e, "Failed to prune expired snapshots");
        }
        Ok(snapshot)
    }

    /// Pin `metrics` as the baseline, replacing any earlier one.
    pub fn set_baseline(&self, ctx: &OpContext, metrics: PerformanceMetrics) -> SwarmResult<()> {
        let baseline = PerformanceSnapshot {
            agent_id: self.agent_id.clone(),
            timestamp: self.store.clock().now(),
            metrics: metrics.clamped(),
        };
        self.store.store_json(
            ctx,
            &self.partition,
            BASELINE_KEY,
            &baseline,
            StoreOptions::new().with_acl(Acl::team(self.agent_id.clone())),
        )?;
        tracing::info!(agent_id = %self.agent_id, "Performance baseline set");
        Ok(())
    }

    /// Snapshots inside the retention window, oldest first.
    pub fn snapshots(&self, ctx: &OpContext) -> SwarmResult<Vec<PerformanceSnapshot>> {
        let cutoff = self.retention_cutoff();
        let mut snapshots = Vec::new();
        for entry in self
            .store
            .query(ctx, &self.partition, |e| e.key.starts_with(SNAPSHOT_PREFIX))?
        {
            match self.store.decoder().decode::<PerformanceSnapshot>(&entry.value) {
                Ok(s) if s.timestamp >= cutoff => snapshots.push(s),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Skipping undecodable snapshot")
                }
            }
        }
        Ok(snapshots)
    }

    /// The explicit baseline, else the earliest retained snapshot.
    pub fn baseline(&self, ctx: &OpContext) -> SwarmResult<Option<PerformanceSnapshot>> {
        match self
            .store
            .retrieve_json::<PerformanceSnapshot>(ctx, &self.partition, BASELINE_KEY)
        {
            Ok(v) => return Ok(Some(v.value)),
            Err(SwarmError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(self.snapshots(ctx)?.into_iter().next())
    }

    /// Compare the latest snapshot against the baseline.
    ///
    /// `None` until there is at least one snapshot.
    pub fn calculate_improvement(&self, ctx: &OpContext) -> SwarmResult<Option<ImprovementSummary>> {
        Ok(self
            .baseline_and_latest(ctx)?
            .map(|(baseline, latest)| self.summarize(&baseline, &latest)))
    }

    fn baseline_and_latest(
        &self,
        ctx: &OpContext,
    ) -> SwarmResult<Option<(PerformanceSnapshot, PerformanceSnapshot)>> {
        let Some(latest) = self.snapshots(ctx)?.pop() else {
            return Ok(None);
        };
        Ok(self.baseline(ctx)?.map(|baseline| (baseline, latest)))
    }

    /// Aggregate scores of the last `days` days and a projection to the
    /// horizon.
    pub fn get_improvement_trend(&self, ctx: &OpContext, days: u32) -> SwarmResult<ImprovementTrend> {
        let since = self.store.clock().now() - chrono::Duration::days(i64::from(days));
        let snapshots: Vec<_> = self
            .snapshots(ctx)?
            .into_iter()
            .filter(|s| s.timestamp >= since)
            .collect();
        let Some(baseline) = self.baseline(ctx)? else {
            return Ok(ImprovementTrend {
                points: Vec::new(),
                slope_per_day: 0.0,
                projected_at: None,
                projected_score: None,
            });
        };

        let points: Vec<TrendPoint> = snapshots
            .iter()
            .map(|s| TrendPoint {
                timestamp: s.timestamp,
                score: aggregate(&baseline.metrics, &s.metrics).1,
            })
            .collect();

        let projected_at = chrono::Duration::from_std(self.config.horizon)
            .ok()
            .map(|h| baseline.timestamp + h);
        let (slope_per_day, projected_score) = match (points.first(), projected_at) {
            (Some(origin), Some(at)) if points.len() >= 2 => {
                let xs: Vec<f64> = points.iter().map(|p| days_between(origin.timestamp, p.timestamp)).collect();
                let ys: Vec<f64> = points.iter().map(|p| p.score).collect();
                match least_squares(&xs, &ys) {
                    Some((slope, intercept)) => {
                        let x = days_between(origin.timestamp, at);
                        (slope, Some(intercept + slope * x))
                    }
                    None => (0.0, None),
                }
            }
            _ => (0.0, None),
        };

        Ok(ImprovementTrend {
            points,
            slope_per_day,
            projected_at,
            projected_score,
        })
    }

    /// Metrics that degraded by more than `tolerance` since the baseline.
    pub fn detect_regressions(&self, ctx: &OpContext, tolerance: f64) -> SwarmResult<Vec<Regression>> {
        Ok(self
            .baseline_and_latest(ctx)?
            .map(|(baseline, latest)| regressions_in(&baseline.metrics, &latest.metrics, tolerance))
            .unwrap_or_default())
    }

    /// Delete snapshots older than the retention window.
    ///
    /// Returns the number deleted.
    pub fn prune_expired_snapshots(&self, ctx: &OpContext) -> SwarmResult<usize> {
        let cutoff = self.retention_cutoff();
        let stale: Vec<String> = self
            .store
            .list_keys(&self.partition)
            .into_iter()
            .filter(|key| parse_snapshot_key(key).is_some_and(|ts| ts < cutoff))
            .collect();

        let mut pruned = 0;
        for key in stale {
            if self.store.delete(ctx, &self.partition, &key)? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            tracing::info!(agent_id = %self.agent_id, pruned, "Pruned expired snapshots");
        }
        Ok(pruned)
    }

    /// Compile summary, improvement, trend and recommendations.
    pub fn generate_report(&self, ctx: &OpContext) -> SwarmResult<PerformanceReport> {
        let snapshots = self.snapshots(ctx)?;
        let compared = self.baseline_and_latest(ctx)?;
        let improvement = compared.as_ref().map(|(b, l)| self.summarize(b, l));
        let horizon_days = (self.config.horizon.as_secs() / 86_400).max(1) as u32;
        let trend = self.get_improvement_trend(ctx, horizon_days)?;
        let regressions = compared
            .as_ref()
            .map(|(b, l)| regressions_in(&b.metrics, &l.metrics, 0.0))
            .unwrap_or_default();

        let summary = ReportSummary {
            snapshot_count: snapshots.len(),
            first_at: snapshots.first().map(|s| s.timestamp),
            last_at: snapshots.last().map(|s| s.timestamp),
            latest: snapshots.last().map(|s| s.metrics),
        };
        let recommendations =
            recommendations(improvement.as_ref(), &trend, &regressions, self.config.target_improvement);

        Ok(PerformanceReport {
            agent_id: self.agent_id.clone(),
            generated_at: self.store.clock().now(),
            summary,
            improvement,
            trend,
            regressions,
            recommendations,
        })
    }

    fn summarize(&self, baseline: &PerformanceSnapshot, latest: &PerformanceSnapshot) -> ImprovementSummary {
        let (metrics, aggregate) = aggregate(&baseline.metrics, &latest.metrics);
        let elapsed = latest.timestamp - baseline.timestamp;
        let within_horizon = elapsed
            .to_std()
            .map(|e| e <= self.config.horizon)
            .unwrap_or(true);
        ImprovementSummary {
            baseline_at: baseline.timestamp,
            current_at: latest.timestamp,
            metrics,
            aggregate,
            target: self.config.target_improvement,
            target_achieved: aggregate >= self.config.target_improvement && within_horizon,
            elapsed_days: days_between(baseline.timestamp, latest.timestamp),
        }
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.store.clock().now() - retention
    }
}

/// Per-metric rates and their weighted mean.
fn aggregate(baseline: &PerformanceMetrics, current: &PerformanceMetrics) -> (Vec<MetricImprovement>, f64) {
    let mut improvements = Vec::new();
    let (mut weighted, mut weights) = (0.0, 0.0);
    for metric in Metric::ALL {
        let (base, cur) = (metric.value(baseline), metric.value(current));
        if let Some(rate) = metric.improvement_rate(base, cur) {
            weighted += metric.weight() * rate;
            weights += metric.weight();
            improvements.push(MetricImprovement {
                metric,
                baseline: base,
                current: cur,
                improvement_rate: rate,
            });
        }
    }
    let score = if weights > 0.0 { weighted / weights } else { 0.0 };
    (improvements, score)
}

fn regressions_in(baseline: &PerformanceMetrics, current: &PerformanceMetrics, tolerance: f64) -> Vec<Regression> {
    Metric::ALL
        .into_iter()
        .filter_map(|metric| {
            let (base, cur) = (metric.value(baseline), metric.value(current));
            let degradation = metric.degradation(base, cur);
            (degradation > tolerance).then_some(Regression {
                metric,
                baseline: base,
                current: cur,
                degradation,
            })
        })
        .collect()
}

fn recommendations(
    improvement: Option<&ImprovementSummary>,
    trend: &ImprovementTrend,
    regressions: &[Regression],
    target: f64,
) -> Vec<String> {
    let Some(improvement) = improvement else {
        return vec!["No performance data yet; record snapshots to start tracking".to_string()];
    };

    let mut out = Vec::new();
    for regression in regressions {
        let advice = match regression.metric {
            Metric::ErrorRate => "error rate increasing, consider reverting last strategy change",
            Metric::AvgExecutionTime => "execution time increasing, review recent strategies for latency cost",
            Metric::SuccessRate => "success rate declining, favour strategies with proven patterns",
            Metric::UserSatisfaction => "user satisfaction declining, review output quality",
            Metric::ResourceEfficiency => "resource efficiency declining, check for wasteful strategies",
        };
        out.push(format!("{} ({:.1}% worse than baseline)", advice, regression.degradation * 100.0));
    }

    if improvement.target_achieved {
        out.push(format!(
            "improvement target of {:.0}% reached ({:.1}%)",
            target * 100.0,
            improvement.aggregate * 100.0
        ));
    } else if let Some(projected) = trend.projected_score {
        if projected >= target {
            out.push(format!("on track: projected {:.1}% by the horizon", projected * 100.0));
        } else {
            out.push(format!(
                "projected {:.1}% by the horizon, short of the {:.0}% target",
                projected * 100.0,
                target * 100.0
            ));
        }
    }

    if trend.slope_per_day < 0.0 {
        out.push("aggregate score trending down".to_string());
    }
    if improvement.metric(Metric::SuccessRate).is_none() {
        out.push("baseline success rate is zero; set an explicit baseline".to_string());
    }
    out
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_DAY
}

/// Ordinary least squares fit `y = slope * x + intercept`.
fn least_squares(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len() as f64;
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let (mut cov, mut var) = (0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var == 0.0 {
        return None;
    }
    let slope = cov / var;
    Some((slope, mean_y - slope * mean_x))
}
