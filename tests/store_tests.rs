/// End-to-end tests for the coordination store.
///
/// These drive the store through the `SwarmMemory` context with a manual
/// clock so TTLs can be crossed without sleeping.
use chrono::Duration as ChronoDuration;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use swarm_memory::{
    AgentDescriptor, EventFilter, EventType, InMemoryAgentRegistry, InMemoryEventBus,
    ManualClock, OpContext, StoreOptions, SwarmConfig, SwarmError, SwarmMemory, json,
};

fn create_memory() -> (SwarmMemory, ManualClock) {
    let clock = ManualClock::default();
    let registry = InMemoryAgentRegistry::new();
    for id in ["agent-1", "agent-2", "agent-3"] {
        registry.register(AgentDescriptor::new(id, "worker"));
    }
    let memory = SwarmMemory::with_parts(
        SwarmConfig::default(),
        Arc::new(registry),
        Arc::new(InMemoryEventBus::default()),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (memory, clock)
}

#[test]
fn test_ttl_expiry_then_stale_version_conflict() {
    let (memory, clock) = create_memory();
    let a = OpContext::new("agent-1");
    let b = OpContext::new("agent-2");

    let v1 = memory
        .store(
            &a,
            "coordination",
            "x",
            b"v1".to_vec(),
            StoreOptions::new().with_ttl(Duration::from_millis(1000)),
        )
        .unwrap();
    assert_eq!(v1, 1);

    let entry = memory.retrieve(&a, "coordination", "x").unwrap();
    assert_eq!(entry.value_str(), Some("v1"));

    clock.advance(ChronoDuration::milliseconds(1100));
    let result = memory.retrieve(&a, "coordination", "x");
    assert!(matches!(result, Err(SwarmError::NotFound { .. })));

    // Fresh key after expiry: version 1 again, then a third party bumps it.
    let v1 = memory
        .store(&a, "coordination", "x", b"v1".to_vec(), StoreOptions::new())
        .unwrap();
    assert_eq!(v1, 1);
    let v2 = memory
        .store(
            &b,
            "coordination",
            "x",
            b"v2".to_vec(),
            StoreOptions::new().with_expected_version(1),
        )
        .unwrap();
    assert_eq!(v2, 2);

    let stale = memory.store(
        &a,
        "coordination",
        "x",
        b"mine".to_vec(),
        StoreOptions::new().with_expected_version(1),
    );
    match stale {
        Err(SwarmError::Conflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    // The losing write never landed.
    let entry = memory.retrieve(&a, "coordination", "x").unwrap();
    assert_eq!(entry.value_str(), Some("v2"));
}

#[test]
fn test_private_entry_hidden_from_other_agents() {
    let (memory, _clock) = create_memory();
    let owner = OpContext::new("agent-1");
    let other = OpContext::new("agent-2");

    memory
        .store(
            &owner,
            "scratch",
            "notes",
            b"secret".to_vec(),
            StoreOptions::new().with_acl(swarm_memory::Acl::private("agent-1")),
        )
        .unwrap();

    let denied = memory.retrieve(&other, "scratch", "notes");
    assert!(matches!(denied, Err(SwarmError::AccessDenied { .. })));
    let overwrite = memory.store(&other, "scratch", "notes", b"x".to_vec(), StoreOptions::new());
    assert!(matches!(overwrite, Err(SwarmError::AccessDenied { .. })));

    assert!(memory.retrieve(&owner, "scratch", "notes").is_ok());
    assert!(memory.retrieve(&OpContext::system(), "scratch", "notes").is_ok());
}

#[test]
fn test_query_skips_expired_and_filters() {
    let (memory, clock) = create_memory();
    let ctx = OpContext::new("agent-1");

    for i in 0..5 {
        memory
            .put_json(&ctx, "tasks", &format!("t{}", i), &json!({"n": i}), StoreOptions::new())
            .unwrap();
    }
    memory
        .put_json(
            &ctx,
            "tasks",
            "short",
            &json!({"n": 99}),
            StoreOptions::new().with_ttl(Duration::from_millis(10)),
        )
        .unwrap();
    clock.advance(ChronoDuration::milliseconds(20));

    let all = memory.query(&ctx, "tasks", |_| true).unwrap();
    assert_eq!(all.len(), 5);

    let late = memory
        .query(&ctx, "tasks", |e| e.key.as_str() >= "t3")
        .unwrap();
    assert_eq!(late.len(), 2);
}

#[test]
fn test_change_events_published() {
    let (memory, _clock) = create_memory();
    let ctx = OpContext::new("agent-1");
    let (_id, mut rx) = memory
        .memory_store()
        .subscribe(EventFilter::partition("coordination"));

    memory
        .store(&ctx, "coordination", "x", b"1".to_vec(), StoreOptions::new())
        .unwrap();
    memory
        .store(&ctx, "other", "y", b"1".to_vec(), StoreOptions::new())
        .unwrap();
    memory.delete(&ctx, "coordination", "x").unwrap();

    let first = rx.try_recv().unwrap();
    assert_eq!(first.event_type, EventType::Stored);
    assert_eq!(first.key, "x");
    let second = rx.try_recv().unwrap();
    assert_eq!(second.event_type, EventType::Deleted);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_circular_reference_rejected_on_read() {
    let (memory, _clock) = create_memory();
    let ctx = OpContext::new("agent-1");
    let cyclic = br##"{"a": {"$ref": "#"}}"##.to_vec();
    memory
        .store(&ctx, "docs", "loop", cyclic, StoreOptions::new())
        .unwrap();

    let result = memory.get_json_resolved(&ctx, "docs", "loop");
    assert!(matches!(result, Err(SwarmError::Malformed(_))));

    // Plain reads return the document as stored.
    let raw = memory.get_json::<serde_json::Value>(&ctx, "docs", "loop").unwrap();
    assert_eq!(raw.value, serde_json::json!({"a": {"$ref": "#"}}));
}

#[test]
fn test_resolved_read_expands_references() {
    let (memory, _clock) = create_memory();
    let ctx = OpContext::new("agent-1");
    let doc = br##"{"defs": {"retry": {"max": 3}}, "policy": {"$ref": "#/defs/retry"}}"##.to_vec();
    memory
        .store(&ctx, "docs", "policy", doc, StoreOptions::new())
        .unwrap();

    let resolved = memory.get_json_resolved(&ctx, "docs", "policy").unwrap();
    assert_eq!(resolved.value["policy"], serde_json::json!({"max": 3}));
    assert_eq!(resolved.version, 1);
}

#[tokio::test]
async fn test_sweep_removes_expired_entries() {
    let (memory, clock) = create_memory();
    let ctx = OpContext::new("agent-1");
    for i in 0..3 {
        memory
            .store(
                &ctx,
                "cache",
                &format!("k{}", i),
                b"v".to_vec(),
                StoreOptions::new().with_ttl(Duration::from_secs(1)),
            )
            .unwrap();
    }
    memory
        .store(&ctx, "cache", "keep", b"v".to_vec(), StoreOptions::new())
        .unwrap();

    clock.advance(ChronoDuration::seconds(2));
    let report = memory.sweep().await;
    assert_eq!(report.expired_entries, 3);
    assert_eq!(memory.memory_store().list_keys("cache"), vec!["keep".to_string()]);
}

proptest! {
    #[test]
    fn prop_versions_strictly_increase(values in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..20)) {
        let (memory, _clock) = create_memory();
        let ctx = OpContext::new("agent-1");
        let mut last = 0u64;
        for value in values {
            let version = memory
                .store(&ctx, "prop", "k", value.clone(), StoreOptions::new())
                .unwrap();
            prop_assert!(version > last);
            last = version;
            let entry = memory.retrieve(&ctx, "prop", "k").unwrap();
            prop_assert_eq!(entry.value, value);
        }
    }

    #[test]
    fn prop_stale_expected_version_never_overwrites(writes in 2u64..10, stale in 0u64..10) {
        let (memory, _clock) = create_memory();
        let ctx = OpContext::new("agent-1");
        for i in 0..writes {
            memory
                .store(&ctx, "prop", "k", i.to_string().into_bytes(), StoreOptions::new())
                .unwrap();
        }
        prop_assume!(stale != writes);

        let result = memory.store(
            &ctx,
            "prop",
            "k",
            b"stale".to_vec(),
            StoreOptions::new().with_expected_version(stale),
        );
        let is_conflict = matches!(result, Err(SwarmError::Conflict { .. }));
        prop_assert!(is_conflict);
        let entry = memory.retrieve(&ctx, "prop", "k").unwrap();
        prop_assert_eq!(entry.version, writes);
        prop_assert_eq!(entry.value, (writes - 1).to_string().into_bytes());
    }
}
