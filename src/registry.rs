//! Agent registry collaborator.
//!
//! The registry supplies `(agent_id, type, capabilities)` for every agent in
//! the fleet. The store consults it to decide team membership during ACL
//! checks; the consensus coordinator uses it to size the electorate.
use crate::types::AgentId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Registration record of one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent identifier
    pub agent_id: AgentId,
    /// Worker type (e.g. "test-generator")
    pub agent_type: String,
    /// Declared capabilities
    pub capabilities: BTreeSet<String>,
    /// Explicit team; agents without one are grouped by type
    pub team: Option<String>,
}

impl AgentDescriptor {
    /// A descriptor with no capabilities or explicit team.
    pub fn new(agent_id: impl Into<AgentId>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            team: None,
        }
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Assign an explicit team.
    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    /// The team used for `Visibility::Team` checks.
    pub fn team_name(&self) -> &str {
        self.team.as_deref().unwrap_or(&self.agent_type)
    }
}

/// Source of agent registrations.
pub trait AgentRegistry: Send + Sync + fmt::Debug {
    /// Look up an agent.
    fn get(&self, agent_id: &str) -> Option<AgentDescriptor>;

    /// Number of registered agents.
    fn count(&self) -> usize;

    /// Whether two agents share a team. Unknown agents share no team.
    fn same_team(&self, a: &str, b: &str) -> bool {
        match (self.get(a), self.get(b)) {
            (Some(a), Some(b)) => a.team_name() == b.team_name(),
            _ => false,
        }
    }
}

/// Registry kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryAgentRegistry {
    agents: DashMap<AgentId, AgentDescriptor>,
}

impl InMemoryAgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a registration.
    pub fn register(&self, descriptor: AgentDescriptor) {
        tracing::debug!(agent_id = %descriptor.agent_id, agent_type = %descriptor.agent_type, "Agent registered");
        self.agents
            .insert(descriptor.agent_id.clone(), descriptor);
    }

    /// Remove a registration.
    pub fn unregister(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents.remove(agent_id).map(|(_, d)| d)
    }

    /// All registered agent IDs, sorted.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.agents.get(agent_id).map(|d| d.clone())
    }

    fn count(&self) -> usize {
        self.agents.len()
    }
}
