//! Common types used throughout swarm-memory.
//!
//! This module defines the store's data model: fully-qualified keys,
//! access-control lists, stored entries, write options, and the per-call
//! operation context that carries the caller's identity and deadline.
use crate::error::{SwarmError, SwarmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier of an agent in the fleet.
pub type AgentId = String;

/// Identity used by internal maintenance (sweeps, restores).
pub const SYSTEM_AGENT: &str = "system";

/// A fully-qualified key combining partition and key.
///
/// Partitions are logical namespaces (e.g. "fleet/patterns"); keys are
/// unique within their partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullKey {
    /// The partition (e.g., "fleet/consensus")
    pub partition: String,
    /// The key within the partition (e.g., "proposal-42")
    pub key: String,
}

impl FullKey {
    /// Create a new fully-qualified key.
    pub fn new(partition: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            key: key.into(),
        }
    }

    /// Get a canonical string representation.
    ///
    /// Format: "partition:key"
    pub fn to_canonical_string(&self) -> String {
        format!("{}:{}", self.partition, self.key)
    }
}

impl fmt::Display for FullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.key)
    }
}

/// Who may read and write an entry besides its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Owner only
    Private,
    /// Owner and agents on the owner's team
    Team,
    /// Every agent
    #[default]
    Public,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Private => write!(f, "private"),
            Visibility::Team => write!(f, "team"),
            Visibility::Public => write!(f, "public"),
        }
    }
}

/// Access-control list of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Owning agent
    pub owner_id: AgentId,
    /// Visibility to non-owners
    pub visibility: Visibility,
}

impl Acl {
    /// An ACL with explicit owner and visibility.
    pub fn new(owner_id: impl Into<AgentId>, visibility: Visibility) -> Self {
        Self {
            owner_id: owner_id.into(),
            visibility,
        }
    }

    /// Owner-only access.
    pub fn private(owner_id: impl Into<AgentId>) -> Self {
        Self::new(owner_id, Visibility::Private)
    }

    /// Owner plus team access.
    pub fn team(owner_id: impl Into<AgentId>) -> Self {
        Self::new(owner_id, Visibility::Team)
    }

    /// Fleet-wide access.
    pub fn public(owner_id: impl Into<AgentId>) -> Self {
        Self::new(owner_id, Visibility::Public)
    }
}

/// A stored entry with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Partition the entry lives in
    pub partition: String,
    /// Key within the partition
    pub key: String,
    /// Opaque value bytes
    pub value: Vec<u8>,
    /// Write counter, starting at 1
    pub version: u64,
    /// Instant after which reads treat the entry as absent
    pub ttl_expires_at: Option<DateTime<Utc>>,
    /// Access control
    pub acl: Acl,
    /// When the key was first written
    pub created_at: DateTime<Utc>,
    /// When the current version was written
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Whether the entry's TTL has elapsed at `now`.
    ///
    /// The expiry instant itself counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expires_at.is_some_and(|at| now >= at)
    }

    /// The value interpreted as UTF-8 text, if valid.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// The fully-qualified key of this entry.
    pub fn full_key(&self) -> FullKey {
        FullKey::new(self.partition.clone(), self.key.clone())
    }
}

/// Options for a `store` call.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Time-to-live from the moment of the write
    pub ttl: Option<Duration>,
    /// Access control; defaults to the existing ACL or a public ACL owned by the caller
    pub acl: Option<Acl>,
    /// Fail with `Conflict` unless the current version equals this (0 = absent)
    pub expected_version: Option<u64>,
}

impl StoreOptions {
    /// Options with no TTL, ACL or version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set an ACL.
    pub fn with_acl(mut self, acl: Acl) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Require the current version to match.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Per-call context: who is calling and until when the call may run.
#[derive(Debug, Clone)]
pub struct OpContext {
    /// The calling agent
    pub caller: AgentId,
    /// Monotonic deadline; `None` means no deadline
    pub deadline: Option<Instant>,
}

impl OpContext {
    /// Context for `caller` without a deadline.
    pub fn new(caller: impl Into<AgentId>) -> Self {
        Self {
            caller: caller.into(),
            deadline: None,
        }
    }

    /// Context for internal maintenance.
    pub fn system() -> Self {
        Self::new(SYSTEM_AGENT)
    }

    /// Set a deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail with `Timeout` once the deadline has passed.
    pub fn check_deadline(&self, operation: &'static str) -> SwarmResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(SwarmError::Timeout { operation }),
            _ => Ok(()),
        }
    }

    /// Whether the caller is the internal maintenance identity.
    pub fn is_system(&self) -> bool {
        self.caller == SYSTEM_AGENT
    }
}
