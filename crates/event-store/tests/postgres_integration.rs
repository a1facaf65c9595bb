//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use event_store::{
    AggregateId, CorrelationId, EventEnvelope, EventStore, EventStoreError, EventStoreExt,
    FaultPoint, OutboxEntry, OutboxStatus, OutboxStore, PostgresEventStore, SagaId, SagaRecord, SagaStore,
    Snapshot, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresEventStore::new(temp_pool.clone())
                .run_migrations()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE outbox, events, snapshots, saga_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
}

fn batch(aggregate_id: AggregateId, from: i64, to: i64) -> (Vec<EventEnvelope>, Vec<OutboxEntry>) {
    let events: Vec<_> = (from..=to)
        .map(|v| {
            EventEnvelope::builder()
                .aggregate_id(aggregate_id)
                .aggregate_type("Account")
                .event_type("FundsDeposited")
                .version(Version::new(v))
                .correlation_id(CorrelationId::new())
                .payload_raw(serde_json::json!({"amount": v * 100}))
                .build()
        })
        .collect();
    let outbox = events
        .iter()
        .map(|e| OutboxEntry::for_event(e).unwrap())
        .collect();
    (events, outbox)
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn commit_persists_events_and_outbox() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let (events, outbox) = batch(id, 1, 3);

    let version = store
        .commit(id, Version::initial(), events.clone(), outbox)
        .await
        .unwrap();
    assert_eq!(version, Version::new(3));

    let stored = store.load_all_events(id).await.unwrap();
    assert_eq!(stored, events_with_db_precision(&stored, &events));
    let pending = store.pending_outbox(10).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|e| e.status == OutboxStatus::Pending));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn fault_between_event_and_outbox_inserts_rolls_back_both() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let (events, outbox) = batch(id, 1, 2);
    store
        .commit(id, Version::initial(), events, outbox)
        .await
        .unwrap();

    store.inject_fault(FaultPoint::AfterEventsAppended).await;
    let (events, outbox) = batch(id, 3, 4);
    let result = store.commit(id, Version::new(2), events, outbox).await;
    assert!(matches!(result, Err(EventStoreError::InjectedFault(_))));

    let event_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let outbox_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!((event_rows, outbox_rows), (2, 2));
    assert_eq!(
        store.get_aggregate_version(id).await.unwrap(),
        Some(Version::new(2))
    );

    let (events, outbox) = batch(id, 3, 4);
    let version = store.commit(id, Version::new(2), events, outbox).await.unwrap();
    assert_eq!(version, Version::new(4));
}

// Postgres stores microseconds; compare everything but the timestamp.
fn events_with_db_precision(
    stored: &[EventEnvelope],
    expected: &[EventEnvelope],
) -> Vec<EventEnvelope> {
    expected
        .iter()
        .zip(stored)
        .map(|(e, s)| EventEnvelope {
            timestamp: s.timestamp,
            ..e.clone()
        })
        .collect()
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn concurrent_commits_with_same_expected_version() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let (events, outbox) = batch(id, 1, 1);
    store
        .commit(id, Version::initial(), events, outbox)
        .await
        .unwrap();

    let (events_a, outbox_a) = batch(id, 2, 2);
    let (events_b, outbox_b) = batch(id, 2, 2);
    let (a, b) = tokio::join!(
        store.commit(id, Version::first(), events_a, outbox_a),
        store.commit(id, Version::first(), events_b, outbox_b),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(
        [a, b]
            .into_iter()
            .filter_map(|r| r.err())
            .all(|e| matches!(e, EventStoreError::ConcurrencyConflict { .. }))
    );
    assert_eq!(store.load_all_events(id).await.unwrap().len(), 2);
    assert_eq!(store.pending_outbox(10).await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn snapshot_roundtrip_and_tail() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let (events, outbox) = batch(id, 1, 4);
    store
        .commit(id, Version::initial(), events, outbox)
        .await
        .unwrap();

    let snapshot =
        Snapshot::capture(id, "Account", Version::new(2), &serde_json::json!({"cents": 300}))
            .unwrap();
    store.save_snapshot(snapshot).await.unwrap();

    let (snapshot, tail) = store.load_aggregate(id).await.unwrap();
    assert_eq!(snapshot.unwrap().version, Version::new(2));
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].version, Version::new(3));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn outbox_marking_and_failures() {
    let store = get_test_store().await;
    let id = AggregateId::new();
    let (events, outbox) = batch(id, 1, 2);
    let first = events[0].event_id;
    let second = events[1].event_id;
    store
        .commit(id, Version::initial(), events, outbox)
        .await
        .unwrap();

    store.mark_dispatched(&[first], Utc::now()).await.unwrap();
    store
        .record_dispatch_failure(second, "rejected", true)
        .await
        .unwrap();

    let first = store.outbox_entry(first).await.unwrap().unwrap();
    assert_eq!(first.status, OutboxStatus::Dispatched);
    assert!(first.dispatched_at.is_some());
    let second = store.outbox_entry(second).await.unwrap().unwrap();
    assert_eq!(second.status, OutboxStatus::Failed);
    assert_eq!(second.attempts, 1);
    assert!(store.pending_outbox(10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon"]
async fn saga_records_optimistic_locking_and_due_scan() {
    let store = get_test_store().await;
    let record = SagaRecord {
        saga_id: SagaId::new(),
        saga_type: "Transfer".to_string(),
        correlation_id: CorrelationId::new(),
        state: "Running".to_string(),
        is_terminal: false,
        next_retry_at: None,
        version: Version::initial(),
        body: serde_json::json!({"step": 0}),
        updated_at: Utc::now(),
    };

    let v1 = store
        .save_saga_instance(record.clone(), Version::initial())
        .await
        .unwrap();
    let conflict = store
        .save_saga_instance(record.clone(), Version::initial())
        .await;
    assert!(matches!(
        conflict,
        Err(EventStoreError::SagaConcurrencyConflict { actual, .. }) if actual == v1
    ));

    let due = store.due_saga_instances(Utc::now(), 10).await.unwrap();
    assert_eq!(due.len(), 1);

    let mut done = record;
    done.is_terminal = true;
    done.state = "Completed".to_string();
    store.save_saga_instance(done, v1).await.unwrap();
    assert!(
        store
            .due_saga_instances(Utc::now(), 10)
            .await
            .unwrap()
            .is_empty()
    );
}
