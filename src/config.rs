//! Strongly typed configuration.
//!
//! Every recognized option is a field with a default. Configuration can be
//! built in code (`SwarmConfig::default()` plus field updates) or read from
//! JSON; unknown JSON fields are rejected and missing fields take their
//! defaults. Durations are expressed in milliseconds on the wire.
use crate::error::{SwarmError, SwarmResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a fleet's shared memory and learning stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmConfig {
    /// Prefix for every partition this fleet writes (default: "fleet")
    pub namespace: String,
    /// Store behavior
    pub store: StoreConfig,
    /// Q-learning parameters
    pub learning: LearningConfig,
    /// Performance tracking
    pub performance: PerformanceConfig,
    /// Consensus defaults
    pub consensus: ConsensusConfig,
    /// Improvement loop
    pub improvement: ImprovementConfig,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            namespace: "fleet".to_string(),
            store: StoreConfig::default(),
            learning: LearningConfig::default(),
            performance: PerformanceConfig::default(),
            consensus: ConsensusConfig::default(),
            improvement: ImprovementConfig::default(),
        }
    }
}

impl SwarmConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> SwarmResult<Self> {
        let config: SwarmConfig = serde_json::from_str(json)
            .map_err(|e| SwarmError::InvalidConfig(format!("unreadable config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for out-of-range values.
    pub fn validate(&self) -> SwarmResult<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(SwarmError::InvalidConfig(
                "namespace must be non-empty and contain no '/'".into(),
            ));
        }
        self.store.validate()?;
        self.learning.validate()?;
        self.performance.validate()?;
        self.improvement.validate()?;
        Ok(())
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// How often the background sweep removes expired entries (default: 1s)
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Number of events retained in the in-memory event log (default: 10 000)
    pub event_log_capacity: usize,
    /// Buffered events per subscriber before lagging (default: 256)
    pub subscriber_capacity: usize,
    /// Maximum nesting depth accepted when decoding stored JSON (default: 64)
    pub max_decode_depth: usize,
    /// Maximum size of a stored value in bytes (default: 4 MiB)
    pub max_value_bytes: usize,
    /// Optional file the sweeper checkpoints the store to
    pub checkpoint_path: Option<PathBuf>,
    /// Attempts for storage I/O before surfacing the error (default: 4)
    pub storage_retry_attempts: u32,
    /// Initial backoff between storage attempts (default: 50ms)
    #[serde(with = "duration_ms")]
    pub storage_retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            event_log_capacity: 10_000,
            subscriber_capacity: 256,
            max_decode_depth: 64,
            max_value_bytes: 4 * 1024 * 1024,
            checkpoint_path: None,
            storage_retry_attempts: 4,
            storage_retry_backoff: Duration::from_millis(50),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> SwarmResult<()> {
        if self.sweep_interval.is_zero() {
            return Err(SwarmError::InvalidConfig("store.sweep_interval must be > 0".into()));
        }
        if self.max_decode_depth == 0 {
            return Err(SwarmError::InvalidConfig("store.max_decode_depth must be > 0".into()));
        }
        if self.storage_retry_attempts == 0 {
            return Err(SwarmError::InvalidConfig(
                "store.storage_retry_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Q-learning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningConfig {
    /// Whether the engine learns at all (default: true)
    pub enabled: bool,
    /// Bellman step size α (default: 0.1)
    pub learning_rate: f64,
    /// Future reward discount γ (default: 0.95)
    pub discount_factor: f64,
    /// Initial ε for epsilon-greedy selection (default: 0.3)
    pub exploration_rate: f64,
    /// Multiplicative ε decay per learning event (default: 0.995)
    pub exploration_decay: f64,
    /// Floor for ε (default: 0.01)
    pub min_exploration_rate: f64,
    /// Experience buffer capacity (default: 1000)
    pub max_experiences: usize,
    /// Experiences replayed per batch (default: 32)
    pub batch_size: usize,
    /// Learning events between batch replays (default: 10)
    pub update_frequency: u64,
    /// Learning events between persistence writes (default: 50)
    pub persist_every: u64,
    /// Estimated byte budget for the Q-table (default: 1 MiB)
    pub q_table_byte_budget: usize,
    /// Minimum usage before a (state, action) pair becomes a pattern (default: 5)
    pub pattern_min_usage: u64,
    /// Minimum success rate before a pair becomes a pattern (default: 0.7)
    pub pattern_min_success_rate: f64,
    /// Versions kept in a pattern's history (default: 32)
    pub pattern_history_limit: usize,
    /// Execution time treated as the full latency penalty (default: 30s)
    #[serde(with = "duration_ms")]
    pub latency_budget: Duration,
    /// Consecutive divergences before the engine disables itself (default: 3)
    pub max_consecutive_failures: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_rate: 0.1,
            discount_factor: 0.95,
            exploration_rate: 0.3,
            exploration_decay: 0.995,
            min_exploration_rate: 0.01,
            max_experiences: 1000,
            batch_size: 32,
            update_frequency: 10,
            persist_every: 50,
            q_table_byte_budget: 1024 * 1024,
            pattern_min_usage: 5,
            pattern_min_success_rate: 0.7,
            pattern_history_limit: 32,
            latency_budget: Duration::from_secs(30),
            max_consecutive_failures: 3,
        }
    }
}

impl LearningConfig {
    fn validate(&self) -> SwarmResult<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(SwarmError::InvalidConfig(format!(
                    "learning.{} must be within [0, 1], got {}",
                    name, v
                )))
            }
        };
        unit("learning_rate", self.learning_rate)?;
        unit("discount_factor", self.discount_factor)?;
        unit("exploration_rate", self.exploration_rate)?;
        unit("exploration_decay", self.exploration_decay)?;
        unit("min_exploration_rate", self.min_exploration_rate)?;
        unit("pattern_min_success_rate", self.pattern_min_success_rate)?;
        if self.max_experiences == 0 || self.batch_size == 0 {
            return Err(SwarmError::InvalidConfig(
                "learning.max_experiences and learning.batch_size must be > 0".into(),
            ));
        }
        if self.update_frequency == 0 || self.persist_every == 0 {
            return Err(SwarmError::InvalidConfig(
                "learning.update_frequency and learning.persist_every must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Performance tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PerformanceConfig {
    /// Snapshots older than this are pruned (default: 90 days)
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    /// Aggregate improvement that counts as success (default: 0.20)
    pub target_improvement: f64,
    /// Window in which the target must be reached (default: 30 days)
    #[serde(with = "duration_ms")]
    pub horizon: Duration,
    /// Task completions between automatic snapshots in `FleetAgent` (default: 10)
    pub snapshot_every: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(90 * 24 * 3600),
            target_improvement: 0.20,
            horizon: Duration::from_secs(30 * 24 * 3600),
            snapshot_every: 10,
        }
    }
}

impl PerformanceConfig {
    fn validate(&self) -> SwarmResult<()> {
        if self.horizon.is_zero() || self.retention.is_zero() {
            return Err(SwarmError::InvalidConfig(
                "performance.horizon and performance.retention must be > 0".into(),
            ));
        }
        if self.snapshot_every == 0 {
            return Err(SwarmError::InvalidConfig(
                "performance.snapshot_every must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Consensus defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusConfig {
    /// Voting window for proposals without an explicit TTL (default: 30s)
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Quorum used by `propose_default` (default: 2)
    pub default_quorum: u32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            default_quorum: 2,
        }
    }
}

/// Improvement loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImprovementConfig {
    /// Apply winning strategies automatically (default: false)
    pub auto_apply: bool,
    /// Winner confidence required for auto-apply (default: 0.95)
    pub confidence_threshold: f64,
    /// Samples per arm for new tests (default: 30)
    pub samples_per_arm: u32,
    /// Below this, a test is flagged low-confidence (default: 30)
    pub min_samples_per_arm: u32,
    /// Patterns below this confidence are not candidates (default: 0.7)
    pub pattern_confidence_floor: f64,
    /// Relative degradation treated as a regression (default: 0.05)
    pub regression_tolerance: f64,
    /// Candidate arms added next to the baseline arm (default: 2)
    pub max_candidate_arms: usize,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            auto_apply: false,
            confidence_threshold: 0.95,
            samples_per_arm: 30,
            min_samples_per_arm: 30,
            pattern_confidence_floor: 0.7,
            regression_tolerance: 0.05,
            max_candidate_arms: 2,
        }
    }
}

impl ImprovementConfig {
    fn validate(&self) -> SwarmResult<()> {
        if self.samples_per_arm == 0 {
            return Err(SwarmError::InvalidConfig(
                "improvement.samples_per_arm must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(SwarmError::InvalidConfig(
                "improvement.confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if self.max_candidate_arms == 0 {
            return Err(SwarmError::InvalidConfig(
                "improvement.max_candidate_arms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Serde adapter storing `Duration` as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SwarmConfig::default();
        config.validate().unwrap();
        assert_eq!(config.learning.learning_rate, 0.1);
        assert_eq!(config.learning.discount_factor, 0.95);
        assert_eq!(config.learning.max_experiences, 1000);
        assert_eq!(config.performance.retention.as_secs(), 90 * 24 * 3600);
        assert!(!config.improvement.auto_apply);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SwarmConfig::from_json(
            r#"{"namespace": "qe", "learning": {"learning_rate": 0.2}, "store": {"sweep_interval": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "qe");
        assert_eq!(config.learning.learning_rate, 0.2);
        assert_eq!(config.learning.discount_factor, 0.95);
        assert_eq!(config.store.sweep_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = SwarmConfig::from_json(r#"{"learning": {"learnin_rate": 0.2}}"#);
        assert!(matches!(result, Err(SwarmError::InvalidConfig(_))));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut config = SwarmConfig::default();
        config.learning.discount_factor = 1.5;
        assert!(matches!(config.validate(), Err(SwarmError::InvalidConfig(_))));

        let mut config = SwarmConfig::default();
        config.namespace = "a/b".into();
        assert!(config.validate().is_err());
    }
}
