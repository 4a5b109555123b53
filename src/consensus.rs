//! Propose/vote/commit consensus over the shared store.
//!
//! A proposal moves through `Proposed -> Voting -> {Committed | Rejected |
//! Expired}`. Voting never blocks: each vote is recorded and tallied
//! eagerly, and a proposal whose deadline passes resolves to `Expired` the
//! next time anyone touches it (a vote, a tally, or the sweeper).
//!
//! Proposals are JSON documents in the consensus partition, updated with
//! optimistic versioning so concurrent voters never lose each other's votes.
use crate::bus::{EventBus, FleetEvent};
use crate::config::ConsensusConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::layout::KeyLayout;
use crate::storage::MemoryStore;
use crate::types::{AgentId, OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    /// Created, not yet open
    Proposed,
    /// Accepting votes
    Voting,
    /// Reached quorum
    Committed,
    /// Quorum became unreachable
    Rejected,
    /// Deadline passed without quorum
    Expired,
}

impl ProposalState {
    /// Whether the proposal no longer accepts votes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalState::Committed | ProposalState::Rejected | ProposalState::Expired
        )
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalState::Proposed => "proposed",
            ProposalState::Voting => "voting",
            ProposalState::Committed => "committed",
            ProposalState::Rejected => "rejected",
            ProposalState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    /// In favour
    Yes,
    /// Against
    No,
}

/// A consensus proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusProposal {
    /// Proposal ID
    pub id: String,
    /// Proposing agent
    pub proposer_id: AgentId,
    /// What is being agreed on
    pub payload: JsonValue,
    /// Yes votes needed to commit
    pub quorum: u32,
    /// Latest vote of each agent
    pub votes: BTreeMap<AgentId, VoteDecision>,
    /// Size of the electorate when known
    pub eligible_voters: Option<u32>,
    /// Lifecycle state
    pub state: ProposalState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Voting deadline
    pub deadline: DateTime<Utc>,
    /// When the proposal reached a terminal state
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConsensusProposal {
    /// Number of yes votes.
    pub fn yes_votes(&self) -> u32 {
        self.count(VoteDecision::Yes)
    }

    /// Number of no votes.
    pub fn no_votes(&self) -> u32 {
        self.count(VoteDecision::No)
    }

    fn count(&self, decision: VoteDecision) -> u32 {
        self.votes.values().filter(|d| **d == decision).count() as u32
    }

    /// Resolve the proposal if the votes or the clock allow it.
    ///
    /// Returns whether the state changed.
    pub fn tally(&mut self, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let next = if self.yes_votes() >= self.quorum {
            ProposalState::Committed
        } else if now >= self.deadline {
            ProposalState::Expired
        } else if self
            .eligible_voters
            .is_some_and(|eligible| eligible.saturating_sub(self.no_votes()) < self.quorum)
        {
            ProposalState::Rejected
        } else {
            return false;
        };
        self.state = next;
        self.resolved_at = Some(now);
        true
    }
}

/// Coordinates proposals for one namespace.
#[derive(Debug, Clone)]
pub struct ConsensusCoordinator {
    store: Arc<MemoryStore>,
    partition: String,
    config: ConsensusConfig,
    bus: Option<Arc<dyn EventBus>>,
}

impl ConsensusCoordinator {
    /// Coordinator for the namespace described by `layout`.
    pub fn new(store: Arc<MemoryStore>, layout: &KeyLayout, config: ConsensusConfig) -> Self {
        Self {
            store,
            partition: layout.consensus_partition(),
            config,
            bus: None,
        }
    }

    /// Publish commits on `bus`.
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Open a proposal.
    ///
    /// The proposal is returned in `Voting`, or already `Committed` when
    /// `quorum` is zero. The electorate is the registry's agent count when
    /// the registry knows any agents.
    pub async fn propose(
        &self,
        ctx: &OpContext,
        payload: JsonValue,
        quorum: u32,
        ttl: Option<Duration>,
    ) -> SwarmResult<ConsensusProposal> {
        ctx.check_deadline("propose")?;
        let now = self.store.clock().now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let deadline = now
            + chrono::Duration::from_std(ttl)
                .map_err(|_| SwarmError::invalid("proposal ttl out of range"))?;
        let electorate = self.store.registry().count() as u32;

        let mut proposal = ConsensusProposal {
            id: format!("prop-{}", Uuid::new_v4()),
            proposer_id: ctx.caller.clone(),
            payload,
            quorum,
            votes: BTreeMap::new(),
            eligible_voters: (electorate > 0).then_some(electorate),
            state: ProposalState::Proposed,
            created_at: now,
            deadline,
            resolved_at: None,
        };
        proposal.state = ProposalState::Voting;
        proposal.tally(now);

        self.store.store_json(
            ctx,
            &self.partition,
            &proposal.id,
            &proposal,
            StoreOptions::new().with_expected_version(0),
        )?;
        tracing::info!(
            proposal_id = %proposal.id,
            proposer = %proposal.proposer_id,
            quorum,
            state = %proposal.state,
            "Proposal opened"
        );
        if proposal.state == ProposalState::Committed {
            self.announce_commit(&proposal).await;
        }
        Ok(proposal)
    }

    /// Open a proposal with the configured default quorum and TTL.
    pub async fn propose_default(
        &self,
        ctx: &OpContext,
        payload: JsonValue,
    ) -> SwarmResult<ConsensusProposal> {
        self.propose(ctx, payload, self.config.default_quorum, None)
            .await
    }

    /// Record the caller's vote and tally.
    ///
    /// A repeated vote replaces the caller's previous one. Voting on a
    /// resolved proposal fails with `ProposalClosed`; a proposal whose
    /// deadline has passed is resolved to `Expired` first.
    pub async fn vote(
        &self,
        ctx: &OpContext,
        proposal_id: &str,
        decision: VoteDecision,
    ) -> SwarmResult<ConsensusProposal> {
        let now = self.store.clock().now();
        let mut expired = false;

        let proposal = self.update(ctx, proposal_id, |mut proposal| {
            expired = false;
            if proposal.state.is_terminal() {
                return Err(SwarmError::ProposalClosed {
                    id: proposal.id,
                    state: proposal.state.to_string(),
                });
            }
            if proposal.tally(now) {
                expired = true;
                return Ok(proposal);
            }
            proposal.votes.insert(ctx.caller.clone(), decision);
            proposal.tally(now);
            Ok(proposal)
        })?;

        if expired {
            tracing::info!(proposal_id, state = %proposal.state, "Proposal resolved before vote");
            return Err(SwarmError::ProposalClosed {
                id: proposal_id.to_string(),
                state: proposal.state.to_string(),
            });
        }

        tracing::debug!(
            proposal_id,
            voter = %ctx.caller,
            ?decision,
            yes = proposal.yes_votes(),
            no = proposal.no_votes(),
            state = %proposal.state,
            "Vote recorded"
        );
        if proposal.state == ProposalState::Committed {
            self.announce_commit(&proposal).await;
        }
        Ok(proposal)
    }

    /// Resolve a proposal against the clock and return it.
    pub async fn tally(&self, ctx: &OpContext, proposal_id: &str) -> SwarmResult<ConsensusProposal> {
        let now = self.store.clock().now();
        let mut preview = self.get_proposal(ctx, proposal_id)?;
        if !preview.tally(now) {
            return Ok(preview);
        }
        let mut changed = false;
        let proposal = self.update(ctx, proposal_id, |mut proposal| {
            changed = proposal.tally(now);
            Ok(proposal)
        })?;
        if changed {
            tracing::info!(proposal_id, state = %proposal.state, "Proposal resolved");
            if proposal.state == ProposalState::Committed {
                self.announce_commit(&proposal).await;
            }
        }
        Ok(proposal)
    }

    /// Fetch a proposal.
    pub fn get_proposal(&self, ctx: &OpContext, proposal_id: &str) -> SwarmResult<ConsensusProposal> {
        match self
            .store
            .retrieve_json::<ConsensusProposal>(ctx, &self.partition, proposal_id)
        {
            Ok(v) => Ok(v.value),
            Err(SwarmError::NotFound { .. }) => {
                Err(SwarmError::ProposalNotFound(proposal_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// All readable proposals in ID order.
    pub fn list_proposals(&self, ctx: &OpContext) -> SwarmResult<Vec<ConsensusProposal>> {
        let mut proposals = Vec::new();
        for entry in self.store.query(ctx, &self.partition, |_| true)? {
            match self.store.decoder().decode::<ConsensusProposal>(&entry.value) {
                Ok(p) => proposals.push(p),
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Skipping undecodable proposal")
                }
            }
        }
        Ok(proposals)
    }

    /// Resolve every open proposal whose deadline has passed.
    ///
    /// Returns the number of proposals expired.
    pub async fn expire_overdue(&self) -> SwarmResult<usize> {
        let ctx = OpContext::system();
        let now = self.store.clock().now();
        let overdue: Vec<String> = self
            .list_proposals(&ctx)?
            .into_iter()
            .filter(|p| !p.state.is_terminal() && now >= p.deadline)
            .map(|p| p.id)
            .collect();

        let mut expired = 0;
        for id in overdue {
            match self.tally(&ctx, &id).await {
                Ok(p) if p.state == ProposalState::Expired => expired += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(proposal_id = %id, error = %e, "Failed to expire proposal"),
            }
        }
        Ok(expired)
    }

    fn update<F>(&self, ctx: &OpContext, proposal_id: &str, mut f: F) -> SwarmResult<ConsensusProposal>
    where
        F: FnMut(ConsensusProposal) -> SwarmResult<ConsensusProposal>,
    {
        let updated = self.store.update_json::<ConsensusProposal, _>(
            ctx,
            &self.partition,
            proposal_id,
            StoreOptions::new(),
            |current| match current {
                Some(proposal) => f(proposal),
                None => Err(SwarmError::ProposalNotFound(proposal_id.to_string())),
            },
        )?;
        Ok(updated.value)
    }

    async fn announce_commit(&self, proposal: &ConsensusProposal) {
        tracing::info!(proposal_id = %proposal.id, yes = proposal.yes_votes(), "Proposal committed");
        if let Some(bus) = &self.bus {
            let event = FleetEvent::ConsensusCommitted {
                proposal_id: proposal.id.clone(),
                proposer_id: proposal.proposer_id.clone(),
                payload: proposal.payload.clone(),
            };
            if let Err(e) = bus.publish(event).await {
                tracing::warn!(error = %e, "Failed to publish consensus commit");
            }
        }
    }
}
