//! Fleet agents and their capabilities.
//!
//! A [`FleetAgent`] owns its learning engine and performance tracker and
//! consumes task lifecycle as [`TaskEvent`] messages from an mpsc channel.
//! Learning failures are logged and never propagate to the task that
//! triggered them.
//!
//! Capabilities are explicit traits: [`LearningCapable`] for agents that
//! learn from executions, [`ConsensusParticipant`] for agents that take part
//! in proposals.
use crate::bus::{EventBus, FleetEvent};
use crate::consensus::{ConsensusCoordinator, ConsensusProposal, VoteDecision};
use crate::error::SwarmResult;
use crate::learning::{LearningEngine, StrategyRecommendation, TaskDescriptor, TaskOutcome};
use crate::performance::{PerformanceMetrics, PerformanceTracker};
use crate::registry::AgentDescriptor;
use crate::types::{AgentId, OpContext};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Task lifecycle message delivered to an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// A task began
    Started(TaskDescriptor),
    /// A task succeeded
    Completed {
        /// The task
        task: TaskDescriptor,
        /// How it went
        outcome: TaskOutcome,
    },
    /// A task failed
    Failed {
        /// The task
        task: TaskDescriptor,
        /// How it went
        outcome: TaskOutcome,
    },
    /// Stop the agent loop
    Shutdown,
}

/// An agent that learns from its task executions.
pub trait LearningCapable {
    /// The agent's engine.
    fn learning_engine(&self) -> &LearningEngine;

    /// The agent's engine, mutably.
    fn learning_engine_mut(&mut self) -> &mut LearningEngine;

    /// Best known strategy for `task`.
    fn recommend_strategy(&self, task: &TaskDescriptor) -> Option<StrategyRecommendation> {
        let engine = self.learning_engine();
        engine.recommend_strategy(&engine.features_for(task))
    }
}

/// An agent that takes part in consensus.
#[async_trait]
pub trait ConsensusParticipant: Send + Sync {
    /// Coordinator of the agent's namespace.
    fn consensus(&self) -> &ConsensusCoordinator;

    /// Context the agent acts under.
    fn context(&self) -> OpContext;

    /// Open a proposal as this agent.
    async fn propose(
        &self,
        payload: JsonValue,
        quorum: u32,
        ttl: Option<Duration>,
    ) -> SwarmResult<ConsensusProposal> {
        self.consensus()
            .propose(&self.context(), payload, quorum, ttl)
            .await
    }

    /// Vote as this agent.
    async fn vote(&self, proposal_id: &str, decision: VoteDecision) -> SwarmResult<ConsensusProposal> {
        self.consensus()
            .vote(&self.context(), proposal_id, decision)
            .await
    }
}

/// Running totals between two snapshots.
#[derive(Debug, Clone, Default)]
struct MetricsWindow {
    tasks: u64,
    successes: u64,
    execution_time_ms: u64,
    satisfaction_sum: f64,
    satisfaction_count: u64,
    resource_usage_sum: f64,
}

impl MetricsWindow {
    fn record(&mut self, outcome: &TaskOutcome) {
        self.tasks += 1;
        if outcome.success {
            self.successes += 1;
        }
        self.execution_time_ms = self.execution_time_ms.saturating_add(outcome.execution_time_ms);
        if let Some(s) = outcome.user_satisfaction {
            self.satisfaction_sum += s;
            self.satisfaction_count += 1;
        }
        self.resource_usage_sum += outcome.resource_usage;
    }

    fn metrics(&self) -> PerformanceMetrics {
        let n = self.tasks.max(1) as f64;
        let success_rate = self.successes as f64 / n;
        PerformanceMetrics {
            tasks_completed: self.tasks,
            success_rate,
            avg_execution_time_ms: self.execution_time_ms as f64 / n,
            error_rate: 1.0 - success_rate,
            // Without feedback, success stands in for satisfaction.
            user_satisfaction: if self.satisfaction_count > 0 {
                self.satisfaction_sum / self.satisfaction_count as f64
            } else {
                success_rate
            },
            resource_efficiency: 1.0 - self.resource_usage_sum / n,
        }
        .clamped()
    }
}

/// A worker agent's coordination side.
#[derive(Debug)]
pub struct FleetAgent {
    descriptor: AgentDescriptor,
    ctx: OpContext,
    engine: LearningEngine,
    tracker: PerformanceTracker,
    consensus: ConsensusCoordinator,
    snapshot_every: u64,
    window: MetricsWindow,
}

impl FleetAgent {
    /// Compose an agent from its parts.
    pub fn new(
        descriptor: AgentDescriptor,
        engine: LearningEngine,
        tracker: PerformanceTracker,
        consensus: ConsensusCoordinator,
        snapshot_every: u64,
    ) -> Self {
        Self {
            ctx: OpContext::new(descriptor.agent_id.clone()),
            descriptor,
            engine,
            tracker,
            consensus,
            snapshot_every: snapshot_every.max(1),
            window: MetricsWindow::default(),
        }
    }

    /// Agent ID.
    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    /// Registry descriptor.
    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// Performance tracker.
    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// Restore learning state.
    ///
    /// A corrupt state disables learning; the agent keeps working.
    pub fn initialize(&mut self) {
        if let Err(e) = self.engine.initialize() {
            tracing::warn!(agent_id = %self.descriptor.agent_id, error = %e, "Learning unavailable");
        }
    }

    /// Handle one lifecycle message. Returns `false` on `Shutdown`.
    pub async fn handle(&mut self, event: TaskEvent) -> bool {
        match event {
            TaskEvent::Started(task) => {
                tracing::debug!(agent_id = %self.descriptor.agent_id, task_id = %task.task_id, "Task started");
                true
            }
            TaskEvent::Completed { task, outcome } | TaskEvent::Failed { task, outcome } => {
                self.on_task_finished(&task, &outcome).await;
                true
            }
            TaskEvent::Shutdown => false,
        }
    }

    /// Learn from a finished task and take a snapshot when due.
    pub async fn on_task_finished(&mut self, task: &TaskDescriptor, outcome: &TaskOutcome) {
        match self.engine.learn_from_execution(task, outcome).await {
            Ok(Some(update)) => tracing::trace!(
                agent_id = %self.descriptor.agent_id,
                task_id = %task.task_id,
                reward = update.reward,
                q_value = update.q_value,
                "Learned from task"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(
                agent_id = %self.descriptor.agent_id,
                task_id = %task.task_id,
                error = %e,
                "Learning failed; task result unaffected"
            ),
        }

        self.window.record(outcome);
        if self.window.tasks >= self.snapshot_every {
            self.flush_snapshot();
        }
    }

    /// Record a snapshot of tasks seen since the last one, if any.
    pub fn flush_snapshot(&mut self) {
        if self.window.tasks == 0 {
            return;
        }
        let metrics = self.window.metrics();
        match self.tracker.record_snapshot(&self.ctx, metrics) {
            Ok(_) => self.window = MetricsWindow::default(),
            Err(e) => tracing::warn!(
                agent_id = %self.descriptor.agent_id,
                error = %e,
                "Failed to record performance snapshot"
            ),
        }
    }

    /// Consume lifecycle messages until `Shutdown` or the channel closes,
    /// then flush and persist. Returns the agent for inspection.
    pub async fn run(mut self, mut events: mpsc::Receiver<TaskEvent>) -> Self {
        tracing::info!(agent_id = %self.descriptor.agent_id, "Agent loop started");
        while let Some(event) = events.recv().await {
            if !self.handle(event).await {
                break;
            }
        }
        self.shutdown();
        self
    }

    /// Flush pending metrics and persist learning state.
    pub fn shutdown(&mut self) {
        self.flush_snapshot();
        if let Err(e) = self.engine.shutdown() {
            tracing::warn!(agent_id = %self.descriptor.agent_id, error = %e, "Failed to persist learning state");
        }
        tracing::info!(agent_id = %self.descriptor.agent_id, "Agent stopped");
    }
}

impl LearningCapable for FleetAgent {
    fn learning_engine(&self) -> &LearningEngine {
        &self.engine
    }

    fn learning_engine_mut(&mut self) -> &mut LearningEngine {
        &mut self.engine
    }
}

impl ConsensusParticipant for FleetAgent {
    fn consensus(&self) -> &ConsensusCoordinator {
        &self.consensus
    }

    fn context(&self) -> OpContext {
        self.ctx.clone()
    }
}

/// Forward `agent_id`'s task events from `bus` into `tx`.
///
/// The task ends when the bus stream ends or the receiver is dropped.
pub fn bridge_bus(bus: &dyn EventBus, agent_id: AgentId, tx: mpsc::Sender<TaskEvent>) -> JoinHandle<()> {
    let mut stream = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let message = match event {
                FleetEvent::TaskStarted { agent_id: a, task } if a == agent_id => TaskEvent::Started(task),
                FleetEvent::TaskCompleted { agent_id: a, task, outcome } if a == agent_id => {
                    TaskEvent::Completed { task, outcome }
                }
                FleetEvent::TaskError { agent_id: a, task, outcome } if a == agent_id => {
                    TaskEvent::Failed { task, outcome }
                }
                _ => continue,
            };
            if tx.send(message).await.is_err() {
                break;
            }
        }
        tracing::debug!(agent_id = %agent_id, "Bus bridge closed");
    })
}
