//! Partition and key naming.
//!
//! ```text
//! {ns}/learning/{agentId}   state
//! {ns}/learning/{agentId}   snapshots/{timestamp}-{seq}
//! {ns}/learning/{agentId}   baseline
//! {ns}/patterns             {patternId}
//! {ns}/consensus            {proposalId}
//! {ns}/blackboard           {hintKey}
//! {ns}/improvement          {testId}
//! ```
//!
//! Timestamps in keys are zero-padded epoch milliseconds so that key order
//! equals time order. Snapshots taken in the same millisecond are told apart
//! by a zero-padded sequence number.
use chrono::{DateTime, TimeZone, Utc};

/// Prefix of snapshot keys inside an agent's learning partition.
pub const SNAPSHOT_PREFIX: &str = "snapshots/";

/// Key of the serialized learning state inside an agent's learning partition.
pub const STATE_KEY: &str = "state";

/// Key of an explicitly set performance baseline.
pub const BASELINE_KEY: &str = "baseline";

/// Builds partition names for one fleet namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    namespace: String,
}

impl KeyLayout {
    /// Layout for `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Partition holding one agent's learning state and snapshots.
    pub fn learning_partition(&self, agent_id: &str) -> String {
        format!("{}/learning/{}", self.namespace, agent_id)
    }

    /// Partition holding discovered patterns.
    pub fn patterns_partition(&self) -> String {
        format!("{}/patterns", self.namespace)
    }

    /// Partition holding consensus proposals.
    pub fn consensus_partition(&self) -> String {
        format!("{}/consensus", self.namespace)
    }

    /// Reserved partition holding blackboard hints.
    pub fn blackboard_partition(&self) -> String {
        format!("{}/blackboard", self.namespace)
    }

    /// Partition holding A/B tests.
    pub fn improvement_partition(&self) -> String {
        format!("{}/improvement", self.namespace)
    }
}

/// Snapshot keys available per millisecond.
pub const SNAPSHOT_SEQ_LIMIT: u32 = 10_000;

/// Snapshot key for the `seq`-th snapshot taken at `timestamp`.
pub fn snapshot_key(timestamp: DateTime<Utc>, seq: u32) -> String {
    format!("{}{:020}-{:04}", SNAPSHOT_PREFIX, timestamp.timestamp_millis().max(0), seq)
}

/// Timestamp encoded in a key built by [`snapshot_key`].
pub fn parse_snapshot_key(key: &str) -> Option<DateTime<Utc>> {
    let (millis, seq) = key.strip_prefix(SNAPSHOT_PREFIX)?.split_once('-')?;
    seq.parse::<u32>().ok()?;
    Utc.timestamp_millis_opt(millis.parse().ok()?).single()
}
