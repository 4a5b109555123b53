//! # swarm-memory
//!
//! Shared coordination memory and reinforcement learning for fleets of
//! autonomous worker agents.
//!
//! - **Coordination store** - partitioned key/value memory with TTLs, ACLs,
//!   optimistic versioning and a change log
//! - **Blackboard & consensus** - short-lived hints and propose/vote/commit
//! - **Learning** - per-agent tabular Q-learning with experience replay and
//!   shared pattern discovery
//! - **Improvement** - performance tracking, regression detection and A/B
//!   tests of learned strategies
//!
//! ## Quick Start
//!
//! ```ignore
//! use swarm_memory::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> SwarmResult<()> {
//!     let memory = SwarmMemory::start(SwarmConfig::default()).await?;
//!     let ctx = OpContext::new("agent-1");
//!
//!     // Store with a TTL
//!     memory.store(
//!         &ctx,
//!         "coordination",
//!         "x",
//!         b"v1".to_vec(),
//!         StoreOptions::new().with_ttl(Duration::from_secs(1)),
//!     )?;
//!
//!     // Advertise work in progress
//!     memory.advertise(&ctx, "working/task-42", json!({"eta_ms": 500}), Duration::from_secs(30))?;
//!
//!     // Agree on something
//!     let proposal = memory.propose(&ctx, json!({"leader": "agent-1"}), 2, None).await?;
//!     memory.vote(&OpContext::new("agent-2"), &proposal.id, VoteDecision::Yes).await?;
//!
//!     memory.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Store** (`storage`, `events`, `access`, `codec`, `persistence`,
//!    `sweeper`) - the only place agents see each other's data
//! 2. **Blackboard & consensus** (`blackboard`, `consensus`) - built on
//!    store primitives
//! 3. **Learning** (`learning`) - one engine per agent, persisted in the store
//! 4. **Performance & improvement** (`performance`, `improvement`)
//! 5. **Fleet surface** (`core`, `agent`, `bus`, `registry`) - the
//!    [`SwarmMemory`] context object and [`FleetAgent`]
//!
//! ## Thread Safety
//!
//! [`MemoryStore`] and [`SwarmMemory`] are `Send + Sync` and shared by
//! `Arc`. Writers race through optimistic versioning; no lock is held across
//! operations. Each agent owns its learning engine and tracker exclusively.

mod core;
mod error;

pub mod access;
pub mod agent;
pub mod blackboard;
pub mod bus;
pub mod clock;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod events;
pub mod improvement;
pub mod layout;
pub mod learning;
pub mod performance;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod sweeper;
pub mod types;

// Public API exports
pub use crate::core::SwarmMemory;
pub use error::{SwarmError, SwarmResult};

pub use agent::{ConsensusParticipant, FleetAgent, LearningCapable, TaskEvent, bridge_bus};
pub use blackboard::{Blackboard, Hint};
pub use bus::{EventBus, FleetEvent, InMemoryEventBus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::{BoundedDecoder, DecodeError};
pub use config::{
    ConsensusConfig, ImprovementConfig, LearningConfig, PerformanceConfig, StoreConfig,
    SwarmConfig,
};
pub use consensus::{ConsensusCoordinator, ConsensusProposal, ProposalState, VoteDecision};
pub use events::{Event, EventFilter, EventType, SubscriptionId};
pub use improvement::{ABTest, ArmResults, CycleReport, ImprovementLoop, TestArm, TestState};
pub use layout::KeyLayout;
pub use learning::{
    LearningEngine, LearningStatus, Pattern, StrategyRecommendation, TaskDescriptor, TaskOutcome,
};
pub use performance::{
    ImprovementSummary, ImprovementTrend, PerformanceMetrics, PerformanceReport,
    PerformanceSnapshot, PerformanceTracker, Regression,
};
pub use registry::{AgentDescriptor, AgentRegistry, InMemoryAgentRegistry};
pub use storage::{MemoryStore, StoreStats, Versioned};
pub use sweeper::{SweepReport, Sweeper};
pub use types::{Acl, AgentId, FullKey, MemoryEntry, OpContext, StoreOptions, Visibility};

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};
pub use serde_json::{Value as JsonValue, json};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use swarm_memory::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::SwarmMemory;
    pub use crate::error::{SwarmError, SwarmResult};
    pub use crate::types::{Acl, AgentId, MemoryEntry, OpContext, StoreOptions, Visibility};
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{Value as JsonValue, json};

    // Fleet surface
    pub use crate::agent::{ConsensusParticipant, FleetAgent, LearningCapable, TaskEvent};
    pub use crate::bus::{EventBus, FleetEvent, InMemoryEventBus};
    pub use crate::config::SwarmConfig;
    pub use crate::registry::{AgentDescriptor, AgentRegistry, InMemoryAgentRegistry};

    // Coordination
    pub use crate::consensus::{ConsensusProposal, ProposalState, VoteDecision};
    pub use crate::blackboard::Hint;

    // Learning and improvement
    pub use crate::improvement::{ABTest, TestArm};
    pub use crate::learning::{TaskDescriptor, TaskOutcome};
    pub use crate::performance::PerformanceMetrics;
}
