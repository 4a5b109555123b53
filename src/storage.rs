//! Partitioned key-value store with TTL, ACL and optimistic versioning.
//!
//! This module implements the shared coordination memory of a fleet:
//!
//! - Every write increments the key's version; callers may pass the version
//!   they read as `expected_version` to turn the write into a
//!   compare-and-swap
//! - Entries may carry a TTL; expiry is enforced inline on every read and
//!   proactively by [`MemoryStore::sweep_expired`]
//! - Every entry carries an ACL checked against the caller's identity
//! - Every mutation appends an [`Event`](crate::events::Event) to the log
//!
//! The store is thread-safe and uses DashMap for concurrent access. The
//! version check and the write happen under the key's shard entry, so two
//! racing writers with the same `expected_version` cannot both succeed and
//! no lock is held between calls.
use crate::access::{Operation, authorize};
use crate::clock::SharedClock;
use crate::codec::BoundedDecoder;
use crate::config::StoreConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::events::{Event, EventFilter, EventLog, EventType, SubscriptionId};
use crate::registry::{AgentRegistry, InMemoryAgentRegistry};
use crate::types::{Acl, FullKey, MemoryEntry, OpContext, SYSTEM_AGENT, StoreOptions};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tokio::sync::broadcast;

/// A decoded JSON value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The decoded value
    pub value: T,
    /// Version of the entry it was decoded from
    pub version: u64,
}

/// Store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Live (unexpired) keys across all partitions
    pub key_count: usize,
    /// Partitions holding at least one live key
    pub partition_count: usize,
    /// Retained events
    pub event_count: usize,
    /// Sequence number of the most recent event
    pub last_event_id: u64,
}

/// Shared coordination store.
pub struct MemoryStore {
    /// Current entry for each key
    entries: DashMap<FullKey, MemoryEntry>,

    /// Append-only change log with subscriber fan-out
    events: EventLog,

    /// Team membership for ACL checks
    registry: Arc<dyn AgentRegistry>,

    /// Time source for TTLs
    clock: SharedClock,

    /// Decoder for typed reads
    decoder: BoundedDecoder,

    /// Largest accepted value
    max_value_bytes: usize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .field("events", &self.events)
            .finish()
    }
}

impl MemoryStore {
    /// Create a store using `registry` for team checks and `clock` for TTLs.
    pub fn new(registry: Arc<dyn AgentRegistry>, clock: SharedClock, config: &StoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            events: EventLog::new(config.event_log_capacity, config.subscriber_capacity),
            registry,
            clock,
            decoder: BoundedDecoder::new(config.max_decode_depth, config.max_value_bytes),
            max_value_bytes: config.max_value_bytes,
        }
    }

    /// A store with an empty registry, the system clock and default settings.
    pub fn standalone() -> Self {
        Self::new(
            Arc::new(InMemoryAgentRegistry::new()),
            crate::clock::system_clock(),
            &StoreConfig::default(),
        )
    }

    /// The store's clock.
    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// The registry used for team checks.
    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    /// The bounded decoder used for typed reads.
    pub fn decoder(&self) -> &BoundedDecoder {
        &self.decoder
    }

    /// Store a value and return its new version.
    ///
    /// # Errors
    ///
    /// - `Conflict` if `opts.expected_version` differs from the current
    ///   version (0 for an absent or expired key)
    /// - `AccessDenied` if the caller may not write the existing entry, or
    ///   tries to change the ACL of an entry it does not own
    /// - `Timeout` if the caller's deadline has passed
    ///
    /// # Example
    ///
    /// ```ignore
    /// let v1 = store.store(&ctx, "coordination", "x", b"v1".to_vec(), StoreOptions::new())?;
    /// let v2 = store.store(&ctx, "coordination", "x", b"v2".to_vec(),
    ///     StoreOptions::new().with_expected_version(v1))?;
    /// ```
    pub fn store(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
        value: Vec<u8>,
        opts: StoreOptions,
    ) -> SwarmResult<u64> {
        ctx.check_deadline("store")?;
        validate_key(partition, key)?;
        if value.len() > self.max_value_bytes {
            return Err(SwarmError::invalid(format!(
                "value of {} bytes exceeds limit of {} bytes",
                value.len(),
                self.max_value_bytes
            )));
        }

        let now = self.clock.now();
        let ttl_expires_at = match opts.ttl {
            Some(ttl) if ttl.is_zero() => {
                return Err(SwarmError::invalid("ttl must be greater than zero"));
            }
            Some(ttl) => Some(
                now + chrono::Duration::from_std(ttl)
                    .map_err(|_| SwarmError::invalid("ttl out of range"))?,
            ),
            None => None,
        };

        let full_key = FullKey::new(partition, key);
        match self.entries.entry(full_key) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let expired = current.is_expired_at(now);
                if expired {
                    self.events.append(
                        EventType::Expired,
                        partition,
                        key,
                        None,
                        SYSTEM_AGENT,
                        now,
                    );
                } else {
                    authorize(
                        &current.acl,
                        ctx,
                        self.registry.as_ref(),
                        Operation::Write,
                        partition,
                        key,
                    )?;
                }

                let actual = if expired { 0 } else { current.version };
                if let Err(conflict) = check_expected(partition, key, opts.expected_version, actual) {
                    if expired {
                        occupied.remove();
                    }
                    return Err(conflict);
                }

                let acl = if expired {
                    opts.acl.unwrap_or_else(|| Acl::public(ctx.caller.clone()))
                } else {
                    match opts.acl {
                        Some(acl) if acl != current.acl => {
                            if ctx.caller != current.acl.owner_id && !ctx.is_system() {
                                return Err(SwarmError::AccessDenied {
                                    agent_id: ctx.caller.clone(),
                                    partition: partition.to_string(),
                                    key: key.to_string(),
                                    operation: "change acl of",
                                });
                            }
                            acl
                        }
                        _ => current.acl.clone(),
                    }
                };
                let created_at = if expired { now } else { current.created_at };
                let version = actual + 1;

                occupied.insert(MemoryEntry {
                    partition: partition.to_string(),
                    key: key.to_string(),
                    value,
                    version,
                    ttl_expires_at,
                    acl,
                    created_at,
                    updated_at: now,
                });
                self.events.append(
                    EventType::Stored,
                    partition,
                    key,
                    Some(version),
                    &ctx.caller,
                    now,
                );
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                check_expected(partition, key, opts.expected_version, 0)?;
                let acl = opts.acl.unwrap_or_else(|| Acl::public(ctx.caller.clone()));
                vacant.insert(MemoryEntry {
                    partition: partition.to_string(),
                    key: key.to_string(),
                    value,
                    version: 1,
                    ttl_expires_at,
                    acl,
                    created_at: now,
                    updated_at: now,
                });
                self.events
                    .append(EventType::Stored, partition, key, Some(1), &ctx.caller, now);
                Ok(1)
            }
        }
    }

    /// Retrieve the current entry for a key.
    ///
    /// Returns `NotFound` if the key is absent or its TTL has elapsed; an
    /// expired entry is removed on the spot.
    pub fn retrieve(&self, ctx: &OpContext, partition: &str, key: &str) -> SwarmResult<MemoryEntry> {
        ctx.check_deadline("retrieve")?;
        let full_key = FullKey::new(partition, key);
        let now = self.clock.now();

        let found = self.entries.get(&full_key).map(|entry| {
            if entry.is_expired_at(now) {
                None
            } else {
                Some(entry.clone())
            }
        });

        match found {
            Some(Some(entry)) => {
                authorize(
                    &entry.acl,
                    ctx,
                    self.registry.as_ref(),
                    Operation::Read,
                    partition,
                    key,
                )?;
                Ok(entry)
            }
            Some(None) => {
                self.expire_if_due(&full_key, now);
                Err(not_found(partition, key))
            }
            None => Err(not_found(partition, key)),
        }
    }

    /// Lazily iterate readable, unexpired entries of a partition in key order.
    ///
    /// The set of candidate keys is fixed when the query starts; each entry
    /// is re-read and re-checked for expiry as it is yielded, so an entry
    /// deleted or expired mid-iteration is skipped. Entries the caller may
    /// not read are skipped silently.
    pub fn query<P>(
        &self,
        ctx: &OpContext,
        partition: &str,
        predicate: P,
    ) -> SwarmResult<QueryIter<'_, P>>
    where
        P: Fn(&MemoryEntry) -> bool,
    {
        ctx.check_deadline("query")?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().partition == partition)
            .map(|entry| entry.key().key.clone())
            .collect();
        keys.sort();

        Ok(QueryIter {
            store: self,
            ctx: ctx.clone(),
            partition: partition.to_string(),
            keys: keys.into_iter(),
            predicate,
        })
    }

    /// Delete a key. Deleting an absent key is not an error.
    ///
    /// Returns whether a live entry was removed.
    pub fn delete(&self, ctx: &OpContext, partition: &str, key: &str) -> SwarmResult<bool> {
        ctx.check_deadline("delete")?;
        let now = self.clock.now();
        match self.entries.entry(FullKey::new(partition, key)) {
            Entry::Occupied(occupied) => {
                if occupied.get().is_expired_at(now) {
                    occupied.remove();
                    self.events
                        .append(EventType::Expired, partition, key, None, SYSTEM_AGENT, now);
                    return Ok(false);
                }
                authorize(
                    &occupied.get().acl,
                    ctx,
                    self.registry.as_ref(),
                    Operation::Delete,
                    partition,
                    key,
                )?;
                occupied.remove();
                self.events
                    .append(EventType::Deleted, partition, key, None, &ctx.caller, now);
                Ok(true)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    /// Remove every expired entry, emitting an `Expired` event for each.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<FullKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|full_key| self.expire_if_due(full_key, now))
            .count();
        if removed > 0 {
            tracing::debug!(removed, "Swept expired entries");
        }
        removed
    }

    /// Remove `full_key` if it is still expired at `now`.
    fn expire_if_due(&self, full_key: &FullKey, now: DateTime<Utc>) -> bool {
        let removed = self
            .entries
            .remove_if(full_key, |_, entry| entry.is_expired_at(now))
            .is_some();
        if removed {
            self.events.append(
                EventType::Expired,
                &full_key.partition,
                &full_key.key,
                None,
                SYSTEM_AGENT,
                now,
            );
        }
        removed
    }

    // =========================================================================
    // Typed JSON helpers
    // =========================================================================

    /// Serialize `value` as JSON and store it.
    pub fn store_json<T: Serialize>(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
        value: &T,
        opts: StoreOptions,
    ) -> SwarmResult<u64> {
        let bytes = serde_json::to_vec(value)?;
        self.store(ctx, partition, key, bytes, opts)
    }

    /// Retrieve and decode a JSON value with the bounded decoder.
    pub fn retrieve_json<T: DeserializeOwned>(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
    ) -> SwarmResult<Versioned<T>> {
        let entry = self.retrieve(ctx, partition, key)?;
        let value = self.decoder.decode(&entry.value)?;
        Ok(Versioned {
            value,
            version: entry.version,
        })
    }

    /// Retrieve a JSON document and expand its `$ref` pointers.
    ///
    /// Fails with `Malformed` on cyclic or dangling references.
    pub fn retrieve_json_resolved(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
    ) -> SwarmResult<Versioned<JsonValue>> {
        let entry = self.retrieve(ctx, partition, key)?;
        let value = self.decoder.decode_resolved(&entry.value)?;
        Ok(Versioned {
            value,
            version: entry.version,
        })
    }

    /// Read-modify-write a JSON value under optimistic versioning.
    ///
    /// `update` receives the current value (`None` when absent) and returns
    /// the value to write. A conflicting concurrent write is retried once
    /// with a fresh read; a second conflict is surfaced to the caller.
    pub fn update_json<T, F>(
        &self,
        ctx: &OpContext,
        partition: &str,
        key: &str,
        opts: StoreOptions,
        mut update: F,
    ) -> SwarmResult<Versioned<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> SwarmResult<T>,
    {
        crate::retry::retry_conflict_once(partition, key, || {
            let (current, version) = match self.retrieve_json::<T>(ctx, partition, key) {
                Ok(v) => (Some(v.value), v.version),
                Err(SwarmError::NotFound { .. }) => (None, 0),
                Err(e) => return Err(e),
            };
            let next = update(current)?;
            let version = self.store_json(
                ctx,
                partition,
                key,
                &next,
                opts.clone().with_expected_version(version),
            )?;
            Ok(Versioned {
                value: next,
                version,
            })
        })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Whether a live entry exists (ignores ACLs).
    pub fn contains_key(&self, partition: &str, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&FullKey::new(partition, key))
            .is_some_and(|e| !e.is_expired_at(now))
    }

    /// All partitions holding live entries, sorted.
    pub fn list_partitions(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut partitions: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| entry.key().partition.clone())
            .collect();
        partitions.sort();
        partitions.dedup();
        partitions
    }

    /// Live keys in a partition, sorted (ignores ACLs).
    pub fn list_keys(&self, partition: &str) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().partition == partition && !entry.value().is_expired_at(now))
            .map(|entry| entry.key().key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Store statistics.
    pub fn stats(&self) -> StoreStats {
        let partitions = self.list_partitions();
        let now = self.clock.now();
        StoreStats {
            key_count: self
                .entries
                .iter()
                .filter(|e| !e.value().is_expired_at(now))
                .count(),
            partition_count: partitions.len(),
            event_count: self.events.len(),
            last_event_id: self.events.last_id(),
        }
    }

    /// Subscribe to change events.
    pub fn subscribe(&self, filter: EventFilter) -> (SubscriptionId, broadcast::Receiver<Event>) {
        self.events.subscribe(filter)
    }

    /// Retained events with a sequence number above `after`.
    pub fn events_since(&self, after: u64) -> Vec<Event> {
        self.events.events_since(after)
    }

    /// The event log.
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Copy every unexpired entry, sorted by key.
    pub fn snapshot_entries(&self) -> Vec<MemoryEntry> {
        let now = self.clock.now();
        let mut entries: Vec<MemoryEntry> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired_at(now))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| (&a.partition, &a.key).cmp(&(&b.partition, &b.key)));
        entries
    }

    /// Load entries from a snapshot, replacing same-key entries.
    ///
    /// Entries that expired while persisted are dropped. Returns the number
    /// of entries loaded.
    pub fn restore_entries(&self, entries: Vec<MemoryEntry>) -> usize {
        let now = self.clock.now();
        let mut loaded = 0;
        for entry in entries {
            if entry.is_expired_at(now) {
                continue;
            }
            self.entries.insert(entry.full_key(), entry);
            loaded += 1;
        }
        tracing::info!(loaded, "Restored store entries");
        loaded
    }
}

/// Lazy iterator returned by [`MemoryStore::query`].
pub struct QueryIter<'a, P> {
    store: &'a MemoryStore,
    ctx: OpContext,
    partition: String,
    keys: std::vec::IntoIter<String>,
    predicate: P,
}

impl<P> Iterator for QueryIter<'_, P>
where
    P: Fn(&MemoryEntry) -> bool,
{
    type Item = MemoryEntry;

    fn next(&mut self) -> Option<MemoryEntry> {
        for key in self.keys.by_ref() {
            match self.store.retrieve(&self.ctx, &self.partition, &key) {
                Ok(entry) if (self.predicate)(&entry) => return Some(entry),
                _ => continue,
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.keys.len()))
    }
}

fn not_found(partition: &str, key: &str) -> SwarmError {
    SwarmError::NotFound {
        partition: partition.to_string(),
        key: key.to_string(),
    }
}

fn check_expected(partition: &str, key: &str, expected: Option<u64>, actual: u64) -> SwarmResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(SwarmError::Conflict {
            partition: partition.to_string(),
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn validate_key(partition: &str, key: &str) -> SwarmResult<()> {
    if partition.is_empty() || key.is_empty() {
        return Err(SwarmError::invalid("partition and key must be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::registry::AgentDescriptor;
    use crate::types::Visibility;
    use chrono::Duration as ChronoDuration;
    use std::thread;
    use std::time::Duration;

    fn create_store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        let registry = InMemoryAgentRegistry::new();
        registry.register(AgentDescriptor::new("alice", "tester"));
        registry.register(AgentDescriptor::new("bob", "tester"));
        registry.register(AgentDescriptor::new("carol", "analyzer"));
        let store = MemoryStore::new(
            Arc::new(registry),
            Arc::new(clock.clone()),
            &StoreConfig::default(),
        );
        (store, clock)
    }

    fn ctx(agent: &str) -> OpContext {
        OpContext::new(agent)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (store, _) = create_store();
        let version = store
            .store(&ctx("alice"), "coordination", "x", b"v1".to_vec(), StoreOptions::new())
            .unwrap();
        assert_eq!(version, 1);

        let entry = store.retrieve(&ctx("alice"), "coordination", "x").unwrap();
        assert_eq!(entry.value, b"v1");
        assert_eq!(entry.acl.owner_id, "alice");
    }

    #[test]
    fn test_retrieve_missing() {
        let (store, _) = create_store();
        let result = store.retrieve(&ctx("alice"), "coordination", "nope");
        assert!(matches!(result, Err(SwarmError::NotFound { .. })));
    }

    #[test]
    fn test_versions_increment() {
        let (store, _) = create_store();
        for expected in 1..=5 {
            let v = store
                .store(&ctx("alice"), "p", "k", vec![expected as u8], StoreOptions::new())
                .unwrap();
            assert_eq!(v, expected);
        }
    }

    #[test]
    fn test_stale_expected_version_conflicts() {
        let (store, _) = create_store();
        store
            .store(&ctx("alice"), "p", "k", b"v1".to_vec(), StoreOptions::new())
            .unwrap();
        store
            .store(&ctx("alice"), "p", "k", b"v2".to_vec(), StoreOptions::new())
            .unwrap();

        let result = store.store(
            &ctx("alice"),
            "p",
            "k",
            b"v3".to_vec(),
            StoreOptions::new().with_expected_version(1),
        );
        assert!(matches!(
            result,
            Err(SwarmError::Conflict { expected: 1, actual: 2, .. })
        ));
        assert_eq!(store.retrieve(&ctx("alice"), "p", "k").unwrap().value, b"v2");
    }

    #[test]
    fn test_expected_version_zero_means_create() {
        let (store, _) = create_store();
        let opts = StoreOptions::new().with_expected_version(0);
        assert_eq!(
            store
                .store(&ctx("alice"), "p", "k", b"a".to_vec(), opts.clone())
                .unwrap(),
            1
        );
        assert!(matches!(
            store.store(&ctx("alice"), "p", "k", b"b".to_vec(), opts),
            Err(SwarmError::Conflict { .. })
        ));
    }

    #[test]
    fn test_ttl_expiry_on_read() {
        let (store, clock) = create_store();
        store
            .store(
                &ctx("alice"),
                "coordination",
                "x",
                b"v1".to_vec(),
                StoreOptions::new().with_ttl(Duration::from_millis(1000)),
            )
            .unwrap();

        clock.advance(ChronoDuration::milliseconds(999));
        assert!(store.retrieve(&ctx("alice"), "coordination", "x").is_ok());

        clock.advance(ChronoDuration::milliseconds(1));
        assert!(matches!(
            store.retrieve(&ctx("alice"), "coordination", "x"),
            Err(SwarmError::NotFound { .. })
        ));
        assert!(!store.contains_key("coordination", "x"));

        let expired: Vec<Event> = store
            .events()
            .events_since(0)
            .into_iter()
            .filter(|e| e.event_type == EventType::Expired)
            .collect();
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_write_after_expiry_restarts_version() {
        let (store, clock) = create_store();
        let opts = StoreOptions::new().with_ttl(Duration::from_millis(10));
        store
            .store(&ctx("alice"), "p", "k", b"a".to_vec(), opts.clone())
            .unwrap();
        store.store(&ctx("alice"), "p", "k", b"b".to_vec(), opts).unwrap();
        clock.advance(ChronoDuration::milliseconds(20));

        let v = store
            .store(&ctx("bob"), "p", "k", b"c".to_vec(), StoreOptions::new())
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(store.retrieve(&ctx("bob"), "p", "k").unwrap().acl.owner_id, "bob");
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let (store, _) = create_store();
        let result = store.store(
            &ctx("alice"),
            "p",
            "k",
            b"a".to_vec(),
            StoreOptions::new().with_ttl(Duration::ZERO),
        );
        assert!(matches!(result, Err(SwarmError::InvalidData { .. })));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let (store, clock) = create_store();
        for i in 0..5 {
            store
                .store(
                    &ctx("alice"),
                    "p",
                    &format!("k{}", i),
                    vec![i],
                    StoreOptions::new().with_ttl(Duration::from_secs(1 + i as u64)),
                )
                .unwrap();
        }
        store
            .store(&ctx("alice"), "p", "forever", vec![9], StoreOptions::new())
            .unwrap();

        clock.advance(ChronoDuration::milliseconds(2500));
        assert_eq!(store.sweep_expired(), 2);
        assert_eq!(store.list_keys("p"), vec!["forever", "k2", "k3", "k4"]);
        assert_eq!(store.sweep_expired(), 0);
    }

    #[test]
    fn test_private_entry_denies_others() {
        let (store, _) = create_store();
        store
            .store(
                &ctx("alice"),
                "p",
                "secret",
                b"s".to_vec(),
                StoreOptions::new().with_acl(Acl::private("alice")),
            )
            .unwrap();

        assert!(matches!(
            store.retrieve(&ctx("bob"), "p", "secret"),
            Err(SwarmError::AccessDenied { operation: "read", .. })
        ));
        assert!(matches!(
            store.store(&ctx("bob"), "p", "secret", b"x".to_vec(), StoreOptions::new()),
            Err(SwarmError::AccessDenied { operation: "write", .. })
        ));
        assert!(matches!(
            store.delete(&ctx("bob"), "p", "secret"),
            Err(SwarmError::AccessDenied { .. })
        ));
        assert!(store.retrieve(&ctx("alice"), "p", "secret").is_ok());
    }

    #[test]
    fn test_team_entry_allows_teammates() {
        let (store, _) = create_store();
        store
            .store(
                &ctx("alice"),
                "p",
                "plan",
                b"1".to_vec(),
                StoreOptions::new().with_acl(Acl::team("alice")),
            )
            .unwrap();

        assert_eq!(
            store
                .store(&ctx("bob"), "p", "plan", b"2".to_vec(), StoreOptions::new())
                .unwrap(),
            2
        );
        assert!(matches!(
            store.retrieve(&ctx("carol"), "p", "plan"),
            Err(SwarmError::AccessDenied { .. })
        ));
        // Teammate wrote, ownership is unchanged.
        let entry = store.retrieve(&ctx("alice"), "p", "plan").unwrap();
        assert_eq!(entry.acl.owner_id, "alice");
        assert_eq!(entry.acl.visibility, Visibility::Team);
    }

    #[test]
    fn test_only_owner_changes_acl() {
        let (store, _) = create_store();
        store
            .store(&ctx("alice"), "p", "k", b"1".to_vec(), StoreOptions::new())
            .unwrap();
        let result = store.store(
            &ctx("bob"),
            "p",
            "k",
            b"2".to_vec(),
            StoreOptions::new().with_acl(Acl::private("bob")),
        );
        assert!(matches!(result, Err(SwarmError::AccessDenied { .. })));

        store
            .store(
                &ctx("alice"),
                "p",
                "k",
                b"3".to_vec(),
                StoreOptions::new().with_acl(Acl::private("alice")),
            )
            .unwrap();
        assert!(store.retrieve(&ctx("bob"), "p", "k").is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _) = create_store();
        store
            .store(&ctx("alice"), "p", "k", b"1".to_vec(), StoreOptions::new())
            .unwrap();
        assert!(store.delete(&ctx("alice"), "p", "k").unwrap());
        assert!(!store.delete(&ctx("alice"), "p", "k").unwrap());
        assert!(!store.delete(&ctx("alice"), "p", "never").unwrap());

        let deleted = store
            .events()
            .events_since(0)
            .into_iter()
            .filter(|e| e.event_type == EventType::Deleted)
            .count();
        assert_eq!(deleted, 1);
    }

    #[test]
    fn test_query_ordered_and_filtered() {
        let (store, clock) = create_store();
        for key in ["c", "a", "b", "d"] {
            store
                .store(&ctx("alice"), "p", key, key.as_bytes().to_vec(), StoreOptions::new())
                .unwrap();
        }
        store
            .store(
                &ctx("alice"),
                "p",
                "e",
                b"e".to_vec(),
                StoreOptions::new().with_ttl(Duration::from_millis(5)),
            )
            .unwrap();
        store
            .store(
                &ctx("carol"),
                "p",
                "f",
                b"f".to_vec(),
                StoreOptions::new().with_acl(Acl::private("carol")),
            )
            .unwrap();
        store
            .store(&ctx("alice"), "other", "a", b"x".to_vec(), StoreOptions::new())
            .unwrap();
        clock.advance(ChronoDuration::milliseconds(10));

        let keys: Vec<String> = store
            .query(&ctx("alice"), "p", |e| e.key != "b")
            .unwrap()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_query_is_lazy() {
        let (store, _) = create_store();
        for key in ["a", "b", "c"] {
            store
                .store(&ctx("alice"), "p", key, vec![1], StoreOptions::new())
                .unwrap();
        }
        let mut iter = store.query(&ctx("alice"), "p", |_| true).unwrap();
        assert_eq!(iter.next().unwrap().key, "a");
        store.delete(&ctx("alice"), "p", "b").unwrap();
        assert_eq!(iter.next().unwrap().key, "c");
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_deadline_respected() {
        let (store, _) = create_store();
        let expired = OpContext::new("alice").with_timeout(Duration::ZERO);
        assert!(matches!(
            store.store(&expired, "p", "k", vec![1], StoreOptions::new()),
            Err(SwarmError::Timeout { operation: "store" })
        ));
        assert!(!store.contains_key("p", "k"));
    }

    #[test]
    fn test_json_helpers_and_update() {
        let (store, _) = create_store();
        let c = ctx("alice");
        store
            .store_json(&c, "p", "counter", &1u32, StoreOptions::new())
            .unwrap();
        let updated = store
            .update_json::<u32, _>(&c, "p", "counter", StoreOptions::new(), |v| {
                Ok(v.unwrap_or(0) + 1)
            })
            .unwrap();
        assert_eq!(updated.value, 2);
        assert_eq!(updated.version, 2);

        let read: Versioned<u32> = store.retrieve_json(&c, "p", "counter").unwrap();
        assert_eq!(read.value, 2);
    }

    #[test]
    fn test_malformed_json_rejected() {
        let (store, _) = create_store();
        let c = ctx("alice");
        let deep = format!("{}{}", "[".repeat(500), "]".repeat(500));
        store
            .store(&c, "p", "deep", deep.into_bytes(), StoreOptions::new())
            .unwrap();
        let result = store.retrieve_json::<serde_json::Value>(&c, "p", "deep");
        assert!(matches!(result, Err(SwarmError::Malformed(_))));
    }

    #[test]
    fn test_concurrent_cas_single_winner() {
        let (store, _) = create_store();
        let store = Arc::new(store);
        store
            .store(&ctx("alice"), "p", "k", vec![0], StoreOptions::new())
            .unwrap();

        let mut handles = vec![];
        for i in 0..16u8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store
                    .store(
                        &OpContext::new("alice"),
                        "p",
                        "k",
                        vec![i],
                        StoreOptions::new().with_expected_version(1),
                    )
                    .is_ok()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.retrieve(&ctx("alice"), "p", "k").unwrap().version, 2);
    }

    #[test]
    fn test_concurrent_writes_distinct_keys() {
        let (store, _) = create_store();
        let store = Arc::new(store);
        let mut handles = vec![];
        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                store
                    .store(
                        &OpContext::new("alice"),
                        "concurrent",
                        &format!("key{}", i),
                        vec![i as u8],
                        StoreOptions::new(),
                    )
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.list_keys("concurrent").len(), 10);
        assert_eq!(store.stats().last_event_id, 10);
    }

    #[test]
    fn test_snapshot_roundtrip_drops_expired() {
        let (store, clock) = create_store();
        store
            .store(&ctx("alice"), "p", "a", vec![1], StoreOptions::new())
            .unwrap();
        store
            .store(
                &ctx("alice"),
                "p",
                "b",
                vec![2],
                StoreOptions::new().with_ttl(Duration::from_secs(1)),
            )
            .unwrap();
        let snapshot = store.snapshot_entries();
        assert_eq!(snapshot.len(), 2);

        let (restored, restored_clock) = create_store();
        restored_clock.set(clock.now() + ChronoDuration::seconds(5));
        assert_eq!(restored.restore_entries(snapshot), 1);
        assert_eq!(restored.list_keys("p"), vec!["a"]);
    }
}
