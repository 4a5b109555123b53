//! Event bus collaborator.
//!
//! The fleet announces task lifecycle on a bus (`task.started`,
//! `task.completed`, `task.error`); this crate consumes those and publishes
//! its own (`pattern.discovered`, `consensus.committed`,
//! `improvement.applied`). [`InMemoryEventBus`] is a tokio broadcast
//! implementation for single-process fleets and tests.
use crate::error::SwarmResult;
use crate::learning::encoding::{TaskDescriptor, TaskOutcome};
use crate::types::AgentId;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

/// A fleet-wide notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum FleetEvent {
    /// An agent began a task
    TaskStarted {
        /// Executing agent
        agent_id: AgentId,
        /// The task
        task: TaskDescriptor,
    },
    /// An agent finished a task successfully
    TaskCompleted {
        /// Executing agent
        agent_id: AgentId,
        /// The task
        task: TaskDescriptor,
        /// How it went
        outcome: TaskOutcome,
    },
    /// An agent's task failed
    TaskError {
        /// Executing agent
        agent_id: AgentId,
        /// The task
        task: TaskDescriptor,
        /// How it went
        outcome: TaskOutcome,
    },
    /// A learning engine created a new pattern
    PatternDiscovered {
        /// Discovering agent
        agent_id: AgentId,
        /// The pattern
        pattern_id: String,
        /// Its strategy
        action: String,
        /// Its confidence
        confidence: f64,
    },
    /// A consensus proposal reached quorum
    ConsensusCommitted {
        /// The proposal
        proposal_id: String,
        /// Who proposed it
        proposer_id: AgentId,
        /// What was agreed
        payload: JsonValue,
    },
    /// The improvement loop applied a winning strategy
    ImprovementApplied {
        /// The A/B test
        test_id: String,
        /// Failure category the test addressed
        category: String,
        /// Winning arm
        arm: String,
        /// Winner confidence
        confidence: f64,
        /// Pattern behind the arm, if any
        pattern_id: Option<String>,
    },
}

impl FleetEvent {
    /// Dotted topic name.
    pub fn topic(&self) -> &'static str {
        match self {
            FleetEvent::TaskStarted { .. } => "task.started",
            FleetEvent::TaskCompleted { .. } => "task.completed",
            FleetEvent::TaskError { .. } => "task.error",
            FleetEvent::PatternDiscovered { .. } => "pattern.discovered",
            FleetEvent::ConsensusCommitted { .. } => "consensus.committed",
            FleetEvent::ImprovementApplied { .. } => "improvement.applied",
        }
    }
}

/// Publish/subscribe transport for fleet events.
#[async_trait]
pub trait EventBus: Send + Sync + std::fmt::Debug {
    /// Publish an event to every current subscriber.
    async fn publish(&self, event: FleetEvent) -> SwarmResult<()>;

    /// Stream of events published after this call.
    fn subscribe(&self) -> BoxStream<'static, FleetEvent>;
}

/// Bus backed by a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl InMemoryEventBus {
    /// Bus buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: FleetEvent) -> SwarmResult<()> {
        tracing::trace!(topic = event.topic(), "Publishing fleet event");
        // No subscribers is not an error for a broadcast bus.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, FleetEvent> {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
