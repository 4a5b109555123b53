//! Blackboard hints.
//!
//! Agents publish short-lived facts ("working on task 42") without knowing
//! who will read them. A hint is an ordinary store entry in the reserved
//! blackboard partition whose TTL is mandatory. Discovery matches keys
//! against a glob pattern where `*` matches any run of characters and `?`
//! matches exactly one.
use crate::error::{SwarmError, SwarmResult};
use crate::layout::KeyLayout;
use crate::storage::MemoryStore;
use crate::types::{AgentId, OpContext, StoreOptions};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

/// A discovered hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hint {
    /// Hint key
    pub key: String,
    /// Agent that advertised it
    pub advertiser_id: AgentId,
    /// Payload
    pub value: JsonValue,
    /// When it stops being discoverable
    pub ttl_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HintRecord {
    advertiser_id: AgentId,
    value: JsonValue,
}

/// Advertise/discover surface over the blackboard partition.
#[derive(Debug, Clone)]
pub struct Blackboard {
    store: Arc<MemoryStore>,
    partition: String,
}

impl Blackboard {
    /// Blackboard of the namespace described by `layout`.
    pub fn new(store: Arc<MemoryStore>, layout: &KeyLayout) -> Self {
        Self {
            store,
            partition: layout.blackboard_partition(),
        }
    }

    /// Publish a hint visible for `ttl`.
    ///
    /// Returns the entry version. A zero TTL is rejected.
    pub fn advertise(
        &self,
        ctx: &OpContext,
        key: &str,
        value: JsonValue,
        ttl: Duration,
    ) -> SwarmResult<u64> {
        if ttl.is_zero() {
            return Err(SwarmError::invalid("hint ttl must be greater than zero"));
        }
        let record = HintRecord {
            advertiser_id: ctx.caller.clone(),
            value,
        };
        let version = self.store.store_json(
            ctx,
            &self.partition,
            key,
            &record,
            StoreOptions::new().with_ttl(ttl),
        )?;
        tracing::debug!(key, advertiser = %ctx.caller, ttl_ms = ttl.as_millis() as u64, "Hint advertised");
        Ok(version)
    }

    /// All unexpired hints whose key matches `pattern`, in key order.
    ///
    /// Every returned hint is unexpired at the moment of return; it may
    /// expire immediately after.
    pub fn discover(&self, ctx: &OpContext, pattern: &str) -> SwarmResult<Vec<Hint>> {
        let matcher = glob_to_regex(pattern)?;
        let mut hints = Vec::new();
        for entry in self
            .store
            .query(ctx, &self.partition, |e| matcher.is_match(&e.key))?
        {
            let Some(ttl_expires_at) = entry.ttl_expires_at else {
                continue;
            };
            match self.store.decoder().decode::<HintRecord>(&entry.value) {
                Ok(record) => hints.push(Hint {
                    key: entry.key,
                    advertiser_id: record.advertiser_id,
                    value: record.value,
                    ttl_expires_at,
                }),
                Err(e) => tracing::warn!(key = %entry.key, error = %e, "Skipping undecodable hint"),
            }
        }

        let now = self.store.clock().now();
        hints.retain(|hint| hint.ttl_expires_at > now);
        Ok(hints)
    }

    /// Remove a hint the caller advertised.
    ///
    /// Returns whether a hint was removed. Withdrawing another agent's hint
    /// fails with `AccessDenied`.
    pub fn withdraw(&self, ctx: &OpContext, key: &str) -> SwarmResult<bool> {
        let record = match self.store.retrieve_json::<HintRecord>(ctx, &self.partition, key) {
            Ok(record) => record.value,
            Err(SwarmError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if record.advertiser_id != ctx.caller && !ctx.is_system() {
            return Err(SwarmError::AccessDenied {
                agent_id: ctx.caller.clone(),
                partition: self.partition.clone(),
                key: key.to_string(),
                operation: "withdraw",
            });
        }
        self.store.delete(ctx, &self.partition, key)
    }
}

/// Compile a `*`/`?` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> SwarmResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| SwarmError::invalid(format!("invalid pattern '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StoreConfig;
    use crate::registry::InMemoryAgentRegistry;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn setup() -> (Blackboard, ManualClock) {
        let clock = ManualClock::default();
        let store = MemoryStore::new(
            Arc::new(InMemoryAgentRegistry::new()),
            Arc::new(clock.clone()),
            &StoreConfig::default(),
        );
        (
            Blackboard::new(Arc::new(store), &KeyLayout::new("fleet")),
            clock,
        )
    }

    #[test]
    fn test_glob_matching() {
        let re = glob_to_regex("working/*").unwrap();
        assert!(re.is_match("working/agent-1"));
        assert!(!re.is_match("idle/agent-1"));

        let re = glob_to_regex("task-?").unwrap();
        assert!(re.is_match("task-1"));
        assert!(!re.is_match("task-12"));

        let re = glob_to_regex("a.b").unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"));
    }

    #[test]
    fn test_advertise_and_discover() {
        let (board, _) = setup();
        let a1 = OpContext::new("a1");
        board
            .advertise(&a1, "working/t2", json!({"task": 2}), Duration::from_secs(10))
            .unwrap();
        board
            .advertise(&a1, "working/t1", json!({"task": 1}), Duration::from_secs(10))
            .unwrap();
        board
            .advertise(&a1, "idle/a1", json!(true), Duration::from_secs(10))
            .unwrap();

        let hints = board.discover(&OpContext::new("a2"), "working/*").unwrap();
        let keys: Vec<&str> = hints.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["working/t1", "working/t2"]);
        assert_eq!(hints[0].advertiser_id, "a1");
        assert_eq!(hints[0].value, json!({"task": 1}));
    }

    #[test]
    fn test_expired_hints_not_discovered() {
        let (board, clock) = setup();
        let ctx = OpContext::new("a1");
        board
            .advertise(&ctx, "short", json!(1), Duration::from_millis(100))
            .unwrap();
        board
            .advertise(&ctx, "long", json!(2), Duration::from_secs(60))
            .unwrap();
        clock.advance(ChronoDuration::milliseconds(100));

        let hints = board.discover(&ctx, "*").unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].key, "long");
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let (board, _) = setup();
        let result = board.advertise(&OpContext::new("a1"), "k", json!(1), Duration::ZERO);
        assert!(matches!(result, Err(SwarmError::InvalidData { .. })));
    }

    #[test]
    fn test_withdraw_only_own_hint() {
        let (board, _) = setup();
        let a1 = OpContext::new("a1");
        board
            .advertise(&a1, "working/t1", json!(1), Duration::from_secs(10))
            .unwrap();

        assert!(matches!(
            board.withdraw(&OpContext::new("a2"), "working/t1"),
            Err(SwarmError::AccessDenied { .. })
        ));
        assert!(board.withdraw(&a1, "working/t1").unwrap());
        assert!(!board.withdraw(&a1, "working/t1").unwrap());
        assert!(board.discover(&a1, "*").unwrap().is_empty());
    }
}
