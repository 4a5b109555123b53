//! Change events emitted by the store.
//!
//! Every successful mutation appends an [`Event`] to a bounded, append-only
//! log and fans it out to matching subscribers. Subscriptions can be:
//!
//! - **Partition-level**: every change in one partition
//! - **Key-prefix**: changes to keys starting with a prefix
//! - **Type-filtered**: only stores, deletes or expiries
//!
//! # Example
//!
//! ```ignore
//! use swarm_memory::events::{EventFilter, EventLog};
//!
//! let log = EventLog::new(10_000, 256);
//! let (_id, mut rx) = log.subscribe(EventFilter::partition("fleet/patterns"));
//!
//! while let Ok(event) = rx.recv().await {
//!     println!("{} {}", event.event_type, event.key);
//! }
//! ```
use crate::error::{SwarmError, SwarmResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A value was created or overwritten.
    Stored,
    /// A value was explicitly deleted.
    Deleted,
    /// A value's TTL elapsed and it was removed.
    Expired,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Stored => write!(f, "stored"),
            EventType::Deleted => write!(f, "deleted"),
            EventType::Expired => write!(f, "expired"),
        }
    }
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, starting at 1
    pub id: u64,
    /// Kind of change
    pub event_type: EventType,
    /// Partition affected
    pub partition: String,
    /// Key affected
    pub key: String,
    /// Version written (stores only)
    pub version: Option<u64>,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
    /// Agent that caused the change
    pub source_agent_id: String,
}

/// Which events a subscriber receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// Optional partition filter (None = all partitions).
    pub partition: Option<String>,
    /// Optional key prefix filter.
    pub key_prefix: Option<String>,
    /// Types of changes to receive.
    pub event_types: Vec<EventType>,
}

impl EventFilter {
    /// Match every event.
    pub fn all() -> Self {
        Self {
            partition: None,
            key_prefix: None,
            event_types: vec![EventType::Stored, EventType::Deleted, EventType::Expired],
        }
    }

    /// Match every event in one partition.
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: Some(partition.into()),
            ..Self::all()
        }
    }

    /// Restrict to keys starting with `prefix`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Restrict to specific event types.
    pub fn with_event_types(mut self, types: Vec<EventType>) -> Self {
        self.event_types = types;
        self
    }

    /// Check if this filter matches an event.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(ref partition) = self.partition {
            if &event.partition != partition {
                return false;
            }
        }
        if let Some(ref prefix) = self.key_prefix {
            if !event.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Information about an active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// The subscription ID.
    pub id: SubscriptionId,
    /// The filter in effect.
    pub filter: EventFilter,
    /// When this subscription was created.
    pub created_at: DateTime<Utc>,
    /// Number of events delivered.
    pub events_delivered: u64,
}

struct SubscriptionState {
    filter: EventFilter,
    sender: broadcast::Sender<Event>,
    created_at: DateTime<Utc>,
    events_delivered: AtomicU64,
}

struct LogInner {
    next_id: u64,
    events: VecDeque<Event>,
}

/// Bounded append-only event log with filtered fan-out.
pub struct EventLog {
    inner: Mutex<LogInner>,
    capacity: usize,
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_subscription: AtomicU64,
    channel_capacity: usize,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("capacity", &self.capacity)
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl EventLog {
    /// Log retaining `capacity` events, with `channel_capacity` buffered
    /// events per subscriber.
    pub fn new(capacity: usize, channel_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                next_id: 1,
                events: VecDeque::with_capacity(capacity.min(1024)),
            }),
            capacity: capacity.max(1),
            subscriptions: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Append an event and notify subscribers. Returns the appended event.
    pub fn append(
        &self,
        event_type: EventType,
        partition: &str,
        key: &str,
        version: Option<u64>,
        source_agent_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Event {
        let event = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let event = Event {
                id: inner.next_id,
                event_type,
                partition: partition.to_string(),
                key: key.to_string(),
                version,
                timestamp,
                source_agent_id: source_agent_id.to_string(),
            };
            inner.next_id += 1;
            if inner.events.len() == self.capacity {
                inner.events.pop_front();
            }
            inner.events.push_back(event.clone());
            event
        };
        self.notify(&event);
        event
    }

    fn notify(&self, event: &Event) {
        for entry in self.subscriptions.iter() {
            let state = entry.value();
            if state.filter.matches(event) && state.sender.send(event.clone()).is_ok() {
                state.events_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Retained events with `id > after`, oldest first.
    pub fn events_since(&self, after: u64) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .events
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// ID of the most recent event (0 when none).
    pub fn last_id(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id - 1
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .len()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to changes.
    ///
    /// Returns the subscription ID and a receiver for events.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionId, broadcast::Receiver<Event>) {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = broadcast::channel(self.channel_capacity);
        self.subscriptions.insert(
            id,
            SubscriptionState {
                filter,
                sender,
                created_at: Utc::now(),
                events_delivered: AtomicU64::new(0),
            },
        );
        (id, receiver)
    }

    /// Unsubscribe from changes.
    pub fn unsubscribe(&self, id: SubscriptionId) -> SwarmResult<()> {
        self.subscriptions
            .remove(&id)
            .ok_or_else(|| SwarmError::invalid(format!("Subscription {} not found", id)))?;
        Ok(())
    }

    /// List all active subscriptions.
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions
            .iter()
            .map(|entry| SubscriptionInfo {
                id: *entry.key(),
                filter: entry.value().filter.clone(),
                created_at: entry.value().created_at,
                events_delivered: entry.value().events_delivered.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(log: &EventLog, t: EventType, partition: &str, key: &str) -> Event {
        log.append(t, partition, key, Some(1), "agent-1", Utc::now())
    }

    #[test]
    fn test_ids_are_monotonic() {
        let log = EventLog::new(10, 8);
        let a = append(&log, EventType::Stored, "p", "a");
        let b = append(&log, EventType::Deleted, "p", "a");
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(log.last_id(), 2);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let log = EventLog::new(3, 8);
        for i in 0..5 {
            append(&log, EventType::Stored, "p", &format!("k{}", i));
        }
        let events = log.events_since(0);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].key, "k2");
        assert_eq!(log.events_since(4).len(), 1);
    }

    #[test]
    fn test_filter_matching() {
        let filter = EventFilter::partition("fleet/patterns")
            .with_key_prefix("p-")
            .with_event_types(vec![EventType::Stored]);
        let log = EventLog::new(10, 8);

        let hit = append(&log, EventType::Stored, "fleet/patterns", "p-1");
        let wrong_type = append(&log, EventType::Expired, "fleet/patterns", "p-1");
        let wrong_prefix = append(&log, EventType::Stored, "fleet/patterns", "q-1");
        let wrong_partition = append(&log, EventType::Stored, "fleet/consensus", "p-1");

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_type));
        assert!(!filter.matches(&wrong_prefix));
        assert!(!filter.matches(&wrong_partition));
    }

    #[tokio::test]
    async fn test_subscribers_receive_matching_events() {
        let log = EventLog::new(10, 8);
        let (id, mut rx) = log.subscribe(EventFilter::partition("a"));
        let (_all, mut rx_all) = log.subscribe(EventFilter::all());

        append(&log, EventType::Stored, "b", "x");
        append(&log, EventType::Stored, "a", "y");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, "y");
        assert_eq!(rx_all.try_recv().unwrap().key, "x");
        assert_eq!(rx_all.try_recv().unwrap().key, "y");

        let info = log
            .list_subscriptions()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();
        assert_eq!(info.events_delivered, 1);

        log.unsubscribe(id).unwrap();
        assert!(log.unsubscribe(id).is_err());
    }
}
