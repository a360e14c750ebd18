//! End-to-end stream lifecycle against the in-memory store: events are
//! scripted at the source, routed through a running manager, and
//! observed at the target and in the catalog.

use adapters::memory::MemoryStore;
use adapters::{ErrorKind, RawEvent};
use catalog::{CheckpointStore, MemoryCatalog, ReplicationRepository, StreamStatus};
use models::{ReplicationConfig, UnifiedType};
use replication::{ManagerOptions, ReplicationManager, StreamSpec};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn fast_options() -> ManagerOptions {
    ManagerOptions {
        stop_deadline: Duration::from_secs(2),
        poll_interval: Duration::from_millis(10),
        batch_size: 10,
        checkpoint_every_events: 1,
        checkpoint_interval: Duration::from_millis(50),
        max_apply_retries: 1,
        backoff_min: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
    }
}

fn insert_event(position: &str, id: i64, name: &str) -> RawEvent {
    RawEvent {
        shard_id: "0".to_string(),
        position: position.to_string(),
        payload: json!({
            "operation": "INSERT",
            "table_name": "users",
            "timestamp": 1_700_000_000,
            "data": { "id": id, "name": name },
            "lsn": position,
        }),
    }
}

fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
    let source = Arc::new(MemoryStore::new("db-src", "appdb"));
    source.seed_table("users", &["id"], &[("id", UnifiedType::Int64)], vec![]);
    let target = Arc::new(MemoryStore::new("db-tgt", "appdb"));
    target.seed_table(
        "users",
        &["id"],
        &[("id", UnifiedType::Int64), ("name", UnifiedType::String)],
        vec![],
    );
    (source, target)
}

fn spec(replication_id: &str) -> StreamSpec {
    let mut replication = ReplicationConfig::new(replication_id, "db-src");
    replication.tables = vec!["users".to_string()];
    StreamSpec {
        replication,
        relationship_id: Some(format!("rel-{replication_id}")),
        rules: Vec::new(),
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}",
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn insert_events_reach_the_target_and_advance_the_position() {
    ops::tracing::init_for_tests();
    let (source, target) = stores();
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = ReplicationManager::new(catalog.clone(), Some(catalog.clone()), fast_options());

    source.push_raw_event(insert_event("S1", 7, "Ada"));

    manager
        .start_stream(spec("rep-1"), source.clone(), target.clone(), None)
        .await
        .unwrap();
    assert!(manager.is_active("rep-1").await);

    let target_probe = target.clone();
    eventually("insert reaches target", move || {
        let target = target_probe.clone();
        async move { !target.rows("users").is_empty() }
    })
    .await;
    assert_eq!(
        target.rows("users"),
        vec![json!({"id": 7, "name": "Ada"}).as_object().unwrap().clone()],
    );

    eventually("position advances", || async {
        manager.stream_position("rep-1").await == Some("S1".to_string())
    })
    .await;

    manager.stop_stream("rep-1").await.unwrap();
    assert!(!manager.is_active("rep-1").await);
    // Stop is idempotent.
    manager.stop_stream("rep-1").await.unwrap();

    let record = catalog.get_replication_source("rep-1").await.unwrap();
    assert_eq!(record.status, StreamStatus::Stopped);
    let checkpoint = catalog.latest("rep-1").await.unwrap().unwrap();
    assert_eq!(checkpoint.token, "S1");
}

#[tokio::test]
async fn a_delete_without_keys_fails_the_event_but_not_the_stream() {
    let (source, target) = stores();
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = ReplicationManager::new(catalog.clone(), Some(catalog.clone()), fast_options());

    source.push_raw_event(RawEvent {
        shard_id: "0".to_string(),
        position: "S1".to_string(),
        payload: json!({
            "operation": "DELETE",
            "table_name": "users",
            "timestamp": 0,
            "data": {},
        }),
    });
    source.push_raw_event(insert_event("S2", 8, "Grace"));

    manager
        .start_stream(spec("rep-2"), source.clone(), target.clone(), None)
        .await
        .unwrap();

    let target_probe = target.clone();
    eventually("subsequent insert still lands", move || {
        let target = target_probe.clone();
        async move { !target.rows("users").is_empty() }
    })
    .await;

    let stats = manager.stream_stats("rep-2").await.unwrap();
    assert_eq!(stats.events_failed, 1);
    assert!(manager.is_active("rep-2").await);

    manager.stop_stream("rep-2").await.unwrap();
}

#[tokio::test]
async fn stop_then_resume_continues_after_the_checkpoint() {
    let (source, target) = stores();
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = ReplicationManager::new(catalog.clone(), Some(catalog.clone()), fast_options());

    for i in 1..=5 {
        source.push_raw_event(insert_event(&format!("S{i}"), i, "first-half"));
    }
    manager
        .start_stream(spec("rep-3"), source.clone(), target.clone(), None)
        .await
        .unwrap();

    let target_probe = target.clone();
    eventually("first five events apply", move || {
        let target = target_probe.clone();
        async move { target.rows("users").len() == 5 }
    })
    .await;

    manager.stop_stream("rep-3").await.unwrap();
    let checkpoint = catalog.latest("rep-3").await.unwrap().unwrap();
    assert_eq!(checkpoint.token, "S5");
    assert_eq!(
        catalog
            .get_replication_source("rep-3")
            .await
            .unwrap()
            .status,
        StreamStatus::Stopped,
    );

    // The source replays its full history; resume must emit only what
    // follows the checkpoint.
    for i in 1..=10 {
        source.push_raw_event(insert_event(&format!("S{i}"), i, "second-half"));
    }
    manager.resume_stream("rep-3").await.unwrap();

    let target_probe = target.clone();
    eventually("second five events apply", move || {
        let target = target_probe.clone();
        async move { target.rows("users").len() == 10 }
    })
    .await;

    // Rows 1..5 kept their first-run image: no replay through the
    // handler, exactly five more applies.
    let rows = target.rows("users");
    let first = rows
        .iter()
        .find(|r| r.get("id") == Some(&json!(1)))
        .unwrap();
    assert_eq!(first.get("name"), Some(&json!("first-half")));
    let stats = manager.stream_stats("rep-3").await.unwrap();
    assert_eq!(stats.events_applied, 10);

    manager.stop_stream("rep-3").await.unwrap();
}

#[tokio::test]
async fn exhausted_apply_retries_fail_the_stream() {
    let (source, target) = stores();
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = ReplicationManager::new(catalog.clone(), Some(catalog.clone()), fast_options());

    // One retry is configured; queue enough failures to exhaust it.
    for _ in 0..5 {
        target.push_apply_failure(ErrorKind::Transient);
    }
    source.push_raw_event(insert_event("S1", 7, "Ada"));

    manager
        .start_stream(spec("rep-4"), source.clone(), target.clone(), None)
        .await
        .unwrap();

    eventually("stream transitions to failed", || async {
        catalog
            .get_replication_source("rep-4")
            .await
            .map(|record| record.status == StreamStatus::Failed)
            .unwrap_or(false)
    })
    .await;
    assert!(!manager.is_active("rep-4").await);
    assert!(target.rows("users").is_empty());
}

#[tokio::test]
async fn shutdown_marks_streams_stopped() {
    let (source, target) = stores();
    let catalog = Arc::new(MemoryCatalog::new());
    let manager = ReplicationManager::new(catalog.clone(), Some(catalog.clone()), fast_options());

    source.push_raw_event(insert_event("S1", 7, "Ada"));
    manager
        .start_stream(spec("rep-5"), source.clone(), target.clone(), None)
        .await
        .unwrap();

    let target_probe = target.clone();
    eventually("event applies before shutdown", move || {
        let target = target_probe.clone();
        async move { !target.rows("users").is_empty() }
    })
    .await;

    manager.shutdown(Duration::from_secs(5)).await;
    assert!(!manager.is_active("rep-5").await);
    assert_eq!(
        catalog
            .get_replication_source("rep-5")
            .await
            .unwrap()
            .status,
        StreamStatus::Stopped,
    );
    let relationship = catalog.relationship_status("rel-rep-5").await.unwrap();
    assert_eq!(relationship.0, StreamStatus::Stopped);
}
