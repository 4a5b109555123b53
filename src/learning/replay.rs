//! Bounded experience replay buffer.
use super::encoding::StateKey;
use crate::types::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One observed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// State the action was taken in
    pub state: StateKey,
    /// Strategy executed
    pub action: String,
    /// Reward received
    pub reward: f64,
    /// State after the action
    pub next_state: StateKey,
    /// When the transition happened
    pub timestamp: DateTime<Utc>,
    /// Agent that experienced it
    pub agent_id: AgentId,
}

/// FIFO ring buffer of experiences.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    experiences: VecDeque<Experience>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Buffer holding at most `capacity` experiences.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            experiences: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append, evicting the oldest experience when full.
    pub fn push(&mut self, experience: Experience) {
        if self.experiences.len() == self.capacity {
            self.experiences.pop_front();
        }
        self.experiences.push_back(experience);
    }

    /// The most recent `n` experiences, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Experience> {
        let skip = self.experiences.len().saturating_sub(n);
        self.experiences.iter().skip(skip).cloned().collect()
    }

    /// All experiences, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Experience> {
        self.experiences.iter()
    }

    /// Number of buffered experiences.
    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }

    /// Maximum number of experiences.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.experiences.clear();
    }
}
