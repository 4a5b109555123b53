/// The fleet-wide context object.
///
/// `SwarmMemory` wires the shared pieces of one fleet together: the store,
/// the agent registry, the event bus, the clock, the blackboard, the
/// consensus coordinator and the background sweeper. Every component
/// receives what it needs at construction; there is no global state.
///
/// # Thread Safety
///
/// `SwarmMemory` is cheap to clone (everything sits behind `Arc`) and can be
/// shared across tasks and threads.
///
/// # Example
///
/// ```ignore
/// use swarm_memory::prelude::*;
///
/// #[tokio::main]
/// async fn main() -> SwarmResult<()> {
///     let memory = SwarmMemory::start(SwarmConfig::default()).await?;
///     let ctx = OpContext::new("agent-1");
///
///     memory.store(&ctx, "coordination", "x", b"v1".to_vec(), StoreOptions::new())?;
///     let entry = memory.retrieve(&ctx, "coordination", "x")?;
///     assert_eq!(entry.value, b"v1");
///
///     memory.shutdown().await;
///     Ok(())
/// }
/// ```
use crate::agent::FleetAgent;
use crate::blackboard::{Blackboard, Hint};
use crate::bus::{EventBus, InMemoryEventBus};
use crate::clock::{SharedClock, system_clock};
use crate::config::SwarmConfig;
use crate::consensus::{ConsensusCoordinator, ConsensusProposal, VoteDecision};
use crate::error::{SwarmError, SwarmResult};
use crate::improvement::ImprovementLoop;
use crate::layout::KeyLayout;
use crate::learning::LearningEngine;
use crate::performance::PerformanceTracker;
use crate::persistence;
use crate::registry::{AgentDescriptor, AgentRegistry, InMemoryAgentRegistry};
use crate::retry;
use crate::storage::{MemoryStore, StoreStats, Versioned};
use crate::sweeper::{SweepReport, Sweeper};
use crate::types::{MemoryEntry, OpContext, StoreOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// Shared memory and coordination for one fleet.
#[derive(Clone)]
pub struct SwarmMemory {
    config: Arc<SwarmConfig>,
    layout: KeyLayout,
    store: Arc<MemoryStore>,
    registry: Arc<dyn AgentRegistry>,
    /// Set when the registry is owned by this context
    local_registry: Option<Arc<InMemoryAgentRegistry>>,
    bus: Arc<dyn EventBus>,
    blackboard: Blackboard,
    consensus: ConsensusCoordinator,
    sweeper: Arc<Sweeper>,
}

impl std::fmt::Debug for SwarmMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmMemory")
            .field("namespace", &self.layout.namespace())
            .field("store", &self.store.stats())
            .field("sweeper_running", &self.sweeper.is_running())
            .finish()
    }
}

impl SwarmMemory {
    /// Start a self-contained fleet context.
    ///
    /// Uses an in-memory registry and bus and the system clock, restores the
    /// checkpoint file when one is configured and present, and starts the
    /// sweeper.
    pub async fn start(config: SwarmConfig) -> SwarmResult<Self> {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let mut memory = Self::with_parts(
            config,
            Arc::clone(&registry) as Arc<dyn AgentRegistry>,
            Arc::new(InMemoryEventBus::default()),
            system_clock(),
        )?;
        memory.local_registry = Some(registry);

        if let Some(path) = memory.config.store.checkpoint_path.clone()
            && persistence::exists(&path).await
        {
            let store = Arc::clone(&memory.store);
            let restored = retry::with_backoff(
                &OpContext::system(),
                memory.config.store.storage_retry_attempts,
                memory.config.store.storage_retry_backoff,
                || persistence::load(&path, &store),
            )
            .await?;
            tracing::info!(path = %path.display(), restored, "Restored store checkpoint");
        }

        memory.sweeper.start();
        tracing::info!(namespace = %memory.layout.namespace(), "Swarm memory started");
        Ok(memory)
    }

    /// Assemble a context from external collaborators.
    ///
    /// The sweeper is not started; call [`start_sweeper`](Self::start_sweeper)
    /// from within a tokio runtime.
    pub fn with_parts(
        config: SwarmConfig,
        registry: Arc<dyn AgentRegistry>,
        bus: Arc<dyn EventBus>,
        clock: SharedClock,
    ) -> SwarmResult<Self> {
        config.validate()?;
        let layout = KeyLayout::new(config.namespace.clone());
        let store = Arc::new(MemoryStore::new(Arc::clone(&registry), clock, &config.store));
        let blackboard = Blackboard::new(Arc::clone(&store), &layout);
        let consensus =
            ConsensusCoordinator::new(Arc::clone(&store), &layout, config.consensus.clone())
                .with_bus(Arc::clone(&bus));
        let sweeper = Sweeper::new(Arc::clone(&store), &config.store).with_consensus(consensus.clone());

        Ok(Self {
            config: Arc::new(config),
            layout,
            store,
            registry,
            local_registry: None,
            bus,
            blackboard,
            consensus,
            sweeper: Arc::new(sweeper),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration.
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Partition layout.
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// The shared store.
    pub fn memory_store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    /// The event bus.
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// Blackboard.
    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    /// Consensus coordinator.
    pub fn consensus(&self) -> &ConsensusCoordinator {
        &self.consensus
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    // =========================================================================
    // Store
    // =========================================================================

    /// Write a value. See [`MemoryStore::store`].
    pub fn store(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
        value: Vec<u8>,
        options: StoreOptions,
    ) -> SwarmResult<u64> {
        self.store.store(ctx, partition, key, value, options)
    }

    /// Read a value. See [`MemoryStore::retrieve`].
    pub fn retrieve(&self, ctx: &OpContext, partition: &str, key: &str) -> SwarmResult<MemoryEntry> {
        self.store.retrieve(ctx, partition, key)
    }

    /// Collect the readable, unexpired entries of `partition` matching
    /// `predicate`, in key order.
    pub fn query<P>(&self, ctx: &OpContext, partition: &str, predicate: P) -> SwarmResult<Vec<MemoryEntry>>
    where
        P: Fn(&MemoryEntry) -> bool,
    {
        Ok(self.store.query(ctx, partition, predicate)?.collect())
    }

    /// Delete a key. See [`MemoryStore::delete`].
    pub fn delete(&self, ctx: &OpContext, partition: &str, key: &str) -> SwarmResult<bool> {
        self.store.delete(ctx, partition, key)
    }

    /// Write a JSON-serializable value.
    pub fn put_json<T: Serialize>(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
        value: &T,
        options: StoreOptions,
    ) -> SwarmResult<u64> {
        self.store.store_json(ctx, partition, key, value, options)
    }

    /// Read and decode a JSON value.
    pub fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
    ) -> SwarmResult<Versioned<T>> {
        self.store.retrieve_json(ctx, partition, key)
    }

    /// Read a JSON document with its `$ref` pointers expanded.
    pub fn get_json_resolved(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
    ) -> SwarmResult<Versioned<JsonValue>> {
        self.store.retrieve_json_resolved(ctx, partition, key)
    }

    // =========================================================================
    // Blackboard & consensus
    // =========================================================================

    /// Advertise a hint.
    pub fn advertise(&self, ctx: &OpContext, key: &str, value: JsonValue, ttl: Duration) -> SwarmResult<u64> {
        self.blackboard.advertise(ctx, key, value, ttl)
    }

    /// Discover hints matching a glob.
    pub fn discover(&self, ctx: &OpContext, pattern: &str) -> SwarmResult<Vec<Hint>> {
        self.blackboard.discover(ctx, pattern)
    }

    /// Withdraw the caller's hint.
    pub fn withdraw(&self, ctx: &OpContext, key: &str) -> SwarmResult<bool> {
        self.blackboard.withdraw(ctx, key)
    }

    /// Open a proposal.
    pub async fn propose(
        &self,
        ctx: &OpContext,
        payload: JsonValue,
        quorum: u32,
        ttl: Option<Duration>,
    ) -> SwarmResult<ConsensusProposal> {
        self.consensus.propose(ctx, payload, quorum, ttl).await
    }

    /// Vote on a proposal.
    pub async fn vote(
        &self,
        ctx: &OpContext,
        proposal_id: &str,
        decision: VoteDecision,
    ) -> SwarmResult<ConsensusProposal> {
        self.consensus.vote(ctx, proposal_id, decision).await
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Add an agent to the context's own registry.
    ///
    /// Fails with `InvalidConfig` when the registry is external.
    pub fn register_agent(&self, descriptor: AgentDescriptor) -> SwarmResult<()> {
        match &self.local_registry {
            Some(registry) => {
                tracing::debug!(agent_id = %descriptor.agent_id, agent_type = %descriptor.agent_type, "Agent registered");
                registry.register(descriptor);
                Ok(())
            }
            None => Err(SwarmError::InvalidConfig(
                "agent registry is managed externally".into(),
            )),
        }
    }

    /// Learning engine for `agent_id`, not yet initialized.
    pub fn learning_engine(&self, agent_id: &str) -> LearningEngine {
        LearningEngine::new(
            agent_id,
            Arc::clone(&self.store),
            self.layout.clone(),
            self.config.learning.clone(),
        )
        .with_bus(Arc::clone(&self.bus))
    }

    /// Performance tracker for `agent_id`.
    pub fn performance_tracker(&self, agent_id: &str) -> PerformanceTracker {
        PerformanceTracker::new(
            agent_id,
            Arc::clone(&self.store),
            &self.layout,
            self.config.performance.clone(),
        )
    }

    /// Improvement loop driven by `agent_id`'s performance.
    pub fn improvement_loop(&self, agent_id: &str) -> ImprovementLoop {
        ImprovementLoop::new(
            Arc::clone(&self.store),
            &self.layout,
            self.performance_tracker(agent_id),
            self.config.improvement.clone(),
            self.config.learning.pattern_history_limit,
        )
        .with_bus(Arc::clone(&self.bus))
    }

    /// Build and initialize a fleet agent, registering it when the
    /// registry is local.
    pub fn create_agent(&self, descriptor: AgentDescriptor) -> FleetAgent {
        if let Some(registry) = &self.local_registry {
            registry.register(descriptor.clone());
        }
        let mut agent = FleetAgent::new(
            descriptor.clone(),
            self.learning_engine(&descriptor.agent_id),
            self.performance_tracker(&descriptor.agent_id),
            self.consensus.clone(),
            self.config.performance.snapshot_every,
        );
        agent.initialize();
        agent
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Start the background sweeper. Returns `false` if already running.
    pub fn start_sweeper(&self) -> bool {
        self.sweeper.start()
    }

    /// Stop the background sweeper. Idempotent.
    pub fn stop_sweeper(&self) {
        self.sweeper.stop();
    }

    /// Run one sweep pass now.
    pub async fn sweep(&self) -> SweepReport {
        self.sweeper.run_once().await
    }

    /// Write the configured checkpoint file.
    ///
    /// Returns the number of entries written, or `None` without a
    /// checkpoint path.
    pub async fn checkpoint(&self) -> SwarmResult<Option<usize>> {
        let Some(path) = &self.config.store.checkpoint_path else {
            return Ok(None);
        };
        let store = self.store.as_ref();
        let written = retry::with_backoff(
            &OpContext::system(),
            self.config.store.storage_retry_attempts,
            self.config.store.storage_retry_backoff,
            || persistence::save(store, path),
        )
        .await?;
        Ok(Some(written))
    }

    /// Stop the sweeper and write a final checkpoint.
    pub async fn shutdown(&self) {
        self.sweeper.shutdown().await;
        if let Err(e) = self.checkpoint().await {
            tracing::warn!(error = %e, "Final checkpoint failed");
        }
        tracing::info!(namespace = %self.layout.namespace(), "Swarm memory stopped");
    }
}
