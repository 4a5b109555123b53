//! Reinforcement learning for fleet agents.
//!
//! - [`encoding`]: versioned state/action/reward encoding of task executions
//! - [`q_table`]: tabular Q-values with batch rollback and a byte budget
//! - [`replay`]: bounded experience replay
//! - [`patterns`]: proven strategies shared through the store
//! - [`engine`]: the per-agent [`LearningEngine`] tying them together
pub mod encoding;
pub mod engine;
pub mod patterns;
pub mod q_table;
pub mod replay;

pub use encoding::{
    ENCODING_VERSION, PreviousOutcome, Priority, StateFeatures, StateKey, TaskDescriptor,
    TaskOutcome,
};
pub use engine::{
    LearningEngine, LearningStatus, LearningUpdate, PersistErrorCallback, StrategyAlternative,
    StrategyRecommendation,
};
pub use patterns::{Pattern, PatternDocument};
pub use q_table::{QEntry, QTable};
pub use replay::{Experience, ReplayBuffer};
