//! Deterministic, versioned encoding of task executions.
//!
//! Encoding version 1 describes a state by five features:
//!
//! | Feature              | Values                                   |
//! |----------------------|------------------------------------------|
//! | task type            | the task's type string                   |
//! | complexity bucket    | `0..=4`, complexity in `[0,1]` in fifths |
//! | capability bucket    | required capabilities `0`, `1`, `2`, `3+`|
//! | priority             | `low`, `medium`, `high`, `critical`      |
//! | previous outcome     | last outcome of this task type           |
//!
//! The action is the strategy the agent executed. The next state is the
//! same task with the previous outcome replaced by this execution's result.
//!
//! Reward starts at `+1` for success and `-1` for failure, then subtracts a
//! latency penalty of up to `0.2` (execution time relative to the latency
//! budget), `0.1 x resource_usage`, and `0.1` per reported error up to
//! `0.3`.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Version tag embedded in every encoded state.
pub const ENCODING_VERSION: u32 = 1;

const COMPLEXITY_BUCKETS: f64 = 5.0;
const MAX_LATENCY_PENALTY: f64 = 0.2;
const RESOURCE_PENALTY: f64 = 0.1;
const ERROR_PENALTY: f64 = 0.1;
const MAX_ERROR_PENALTY: f64 = 0.3;

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Normal work
    #[default]
    Medium,
    /// Expedited work
    High,
    /// Drop-everything work
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A task as seen by the learning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique task identifier
    pub task_id: String,
    /// Kind of work (e.g. "unit-test-generation")
    pub task_type: String,
    /// Estimated complexity in `[0, 1]`
    pub complexity: f64,
    /// Capabilities the task requires
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,
}

impl TaskDescriptor {
    /// A medium-priority task without capability requirements.
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>, complexity: f64) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            complexity,
            required_capabilities: Vec::new(),
            priority: Priority::Medium,
        }
    }

    /// Set required capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Result of executing a task with some strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Strategy (action) the agent executed
    pub strategy: String,
    /// Whether the task succeeded
    pub success: bool,
    /// Wall-clock execution time
    pub execution_time_ms: u64,
    /// Fraction of the agent's resource allowance consumed, in `[0, 1]`
    #[serde(default)]
    pub resource_usage: f64,
    /// Errors reported during execution
    #[serde(default)]
    pub errors: Vec<String>,
    /// Optional satisfaction feedback in `[0, 1]`
    #[serde(default)]
    pub user_satisfaction: Option<f64>,
}

impl TaskOutcome {
    /// A successful execution.
    pub fn success(strategy: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            strategy: strategy.into(),
            success: true,
            execution_time_ms,
            resource_usage: 0.0,
            errors: Vec::new(),
            user_satisfaction: None,
        }
    }

    /// A failed execution with one error.
    pub fn failure(strategy: impl Into<String>, execution_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Self::success(strategy, execution_time_ms)
        }
    }

    /// Set resource usage.
    pub fn with_resource_usage(mut self, usage: f64) -> Self {
        self.resource_usage = usage;
        self
    }

    /// Set satisfaction feedback.
    pub fn with_satisfaction(mut self, satisfaction: f64) -> Self {
        self.user_satisfaction = Some(satisfaction);
        self
    }
}

/// Last observed outcome of a task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreviousOutcome {
    /// No earlier execution of this task type
    #[default]
    None,
    /// The last execution succeeded
    Success,
    /// The last execution failed
    Failure,
}

impl PreviousOutcome {
    /// Outcome class of `outcome`.
    pub fn of(outcome: &TaskOutcome) -> Self {
        if outcome.success {
            PreviousOutcome::Success
        } else {
            PreviousOutcome::Failure
        }
    }
}

impl fmt::Display for PreviousOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviousOutcome::None => write!(f, "none"),
            PreviousOutcome::Success => write!(f, "success"),
            PreviousOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Decoded state features.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateFeatures {
    /// Task type
    pub task_type: String,
    /// Complexity bucket `0..=4`
    pub complexity_bucket: u8,
    /// Capability count bucket `0..=3`
    pub capability_bucket: u8,
    /// Priority
    pub priority: Priority,
    /// Last outcome for this task type
    pub previous_outcome: PreviousOutcome,
}

impl StateFeatures {
    /// Features of `task` given the last outcome of its type.
    pub fn from_task(task: &TaskDescriptor, previous_outcome: PreviousOutcome) -> Self {
        Self {
            task_type: task.task_type.clone(),
            complexity_bucket: complexity_bucket(task.complexity),
            capability_bucket: task.required_capabilities.len().min(3) as u8,
            priority: task.priority,
            previous_outcome,
        }
    }

    /// Encode into a state key.
    pub fn encode(&self) -> StateKey {
        StateKey(format!(
            "v{}|{}|c{}|k{}|{}|{}",
            ENCODING_VERSION,
            self.task_type,
            self.complexity_bucket,
            self.capability_bucket,
            self.priority,
            self.previous_outcome
        ))
    }
}

/// Encoded state, used as the Q-table row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    /// Wrap an already-encoded state.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The encoded form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Task type of a v1 state, if this key is one.
    pub fn task_type(&self) -> Option<&str> {
        let mut parts = self.0.split('|');
        let version = parts.next()?;
        if version != format!("v{}", ENCODING_VERSION) {
            return None;
        }
        parts.next()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn complexity_bucket(complexity: f64) -> u8 {
    if !complexity.is_finite() {
        return 0;
    }
    let scaled = (complexity.clamp(0.0, 1.0) * COMPLEXITY_BUCKETS).floor();
    (scaled as u8).min(COMPLEXITY_BUCKETS as u8 - 1)
}

/// Reward for `outcome` given the latency budget.
pub fn reward(outcome: &TaskOutcome, latency_budget: Duration) -> f64 {
    let base = if outcome.success { 1.0 } else { -1.0 };

    let budget_ms = latency_budget.as_millis().max(1) as f64;
    let latency_penalty =
        (outcome.execution_time_ms as f64 / budget_ms).min(1.0) * MAX_LATENCY_PENALTY;

    let usage = if outcome.resource_usage.is_finite() {
        outcome.resource_usage.clamp(0.0, 1.0)
    } else {
        1.0
    };
    let resource_penalty = usage * RESOURCE_PENALTY;

    let error_penalty = (outcome.errors.len() as f64 * ERROR_PENALTY).min(MAX_ERROR_PENALTY);

    base - latency_penalty - resource_penalty - error_penalty
}
