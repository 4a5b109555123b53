//! Error types for swarm-memory operations.
//!
//! Every fallible operation in the crate returns `Result<T, SwarmError>`.
//! Variants map onto the failure classes a fleet has to react to
//! differently: conflicts are retried, access denials never are, storage
//! failures back off, and learning failures stay isolated from the task
//! that triggered them.
use crate::codec::DecodeError;
use thiserror::Error;

/// The main error type for swarm-memory operations.
#[derive(Error, Debug)]
pub enum SwarmError {
    /// Key is absent or its TTL has elapsed
    #[error("Key '{key}' not found in partition '{partition}'")]
    NotFound {
        /// The partition that was queried
        partition: String,
        /// The key that was not found
        key: String,
    },

    /// Optimistic concurrency check failed
    #[error(
        "Version conflict on '{partition}/{key}': expected version {expected}, current version {actual}"
    )]
    Conflict {
        /// Partition of the contested entry
        partition: String,
        /// Key of the contested entry
        key: String,
        /// Version the caller expected
        expected: u64,
        /// Version actually stored (0 when absent)
        actual: u64,
    },

    /// Caller failed the entry's access-control check
    #[error("Agent '{agent_id}' may not {operation} '{partition}/{key}'")]
    AccessDenied {
        /// The calling agent
        agent_id: String,
        /// Partition of the protected entry
        partition: String,
        /// Key of the protected entry
        key: String,
        /// The attempted operation ("read", "write", "delete")
        operation: &'static str,
    },

    /// I/O or encoding failure in a storage backend
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value failed bounded decoding
    #[error("Malformed value: {0}")]
    Malformed(#[from] DecodeError),

    /// Learning engine failure (corrupt state, disabled engine)
    #[error("Learning error: {0}")]
    Learning(String),

    /// A Q-value became non-finite; the offending update was discarded
    #[error("Q-learning diverged at state '{state}', action '{action}'")]
    Divergence {
        /// Encoded state of the diverging entry
        state: String,
        /// Action of the diverging entry
        action: String,
    },

    /// Unknown consensus proposal
    #[error("Proposal '{0}' not found")]
    ProposalNotFound(String),

    /// Proposal no longer accepts votes
    #[error("Proposal '{id}' is closed ({state})")]
    ProposalClosed {
        /// The proposal ID
        id: String,
        /// Terminal state the proposal reached
        state: String,
    },

    /// Caller-supplied deadline elapsed
    #[error("Operation '{operation}' exceeded its deadline")]
    Timeout {
        /// The operation that timed out
        operation: &'static str,
    },

    /// Invalid argument or data shape
    #[error("Invalid data: {reason}")]
    InvalidData {
        /// Description of why the data is invalid
        reason: String,
    },

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SwarmError {
    /// Shorthand for an `InvalidData` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidData {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Conflicts succeed after a re-read; storage failures may be
    /// transient. Access denials and malformed data never change on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwarmError::Conflict { .. } | SwarmError::Storage(_))
    }
}

impl From<bincode::Error> for SwarmError {
    fn from(err: bincode::Error) -> Self {
        SwarmError::Storage(format!("Binary encoding failed: {}", err))
    }
}

/// Result type alias for swarm-memory operations.
pub type SwarmResult<T> = Result<T, SwarmError>;
