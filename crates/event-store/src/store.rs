use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, OutboxEntry, Result, SagaId, SagaRecord,
    Snapshot, Version,
};

/// Event log side of the storage port.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically appends `events`, advances the aggregate's stored version
    /// and inserts `outbox` entries.
    ///
    /// Fails with `ConcurrencyConflict` when the stored version differs from
    /// `expected_version`. Either everything lands or nothing does.
    ///
    /// Returns the new version of the aggregate.
    async fn commit(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<EventEnvelope>,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version>;

    /// Loads the events of an aggregate with sequence number `>= from_version`,
    /// in ascending order.
    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>>;

    /// Gets the current version of an aggregate.
    ///
    /// Returns None if the aggregate doesn't exist.
    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>>;

    /// Saves a snapshot, replacing any previous one for the aggregate.
    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    /// Retrieves the latest snapshot for an aggregate.
    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>>;
}

/// Dispatcher side of the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` pending entries in commit order.
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Marks entries as dispatched. Entries that are already dispatched keep
    /// their original `dispatched_at`.
    async fn mark_dispatched(&self, event_ids: &[EventId], at: DateTime<Utc>) -> Result<()>;

    /// Records a failed delivery attempt. The entry stays pending unless
    /// `permanent` is set, in which case it moves to `failed`.
    async fn record_dispatch_failure(
        &self,
        event_id: EventId,
        error: &str,
        permanent: bool,
    ) -> Result<()>;

    /// Looks up the outbox entry owned by an event.
    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>>;
}

/// Saga instance side of the storage port.
#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn load_saga_instance(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Saves a saga record if the stored version equals `expected_version`
    /// (`Version::initial()` for a record that must not exist yet).
    ///
    /// Returns the new stored version.
    async fn save_saga_instance(
        &self,
        record: SagaRecord,
        expected_version: Version,
    ) -> Result<Version>;

    /// Non-terminal records whose `next_retry_at` is unset or `<= now`.
    async fn due_saga_instances(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<SagaRecord>>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Checks if an aggregate exists (has any events).
    async fn aggregate_exists(&self, aggregate_id: AggregateId) -> Result<bool> {
        Ok(self.get_aggregate_version(aggregate_id).await?.is_some())
    }

    /// Loads every event of an aggregate.
    async fn load_all_events(&self, aggregate_id: AggregateId) -> Result<Vec<EventEnvelope>> {
        self.load_events(aggregate_id, Version::first()).await
    }

    /// Loads an aggregate's events, optionally starting from a snapshot.
    ///
    /// If a snapshot exists, returns the snapshot and events after it.
    /// Otherwise, returns None and all events.
    async fn load_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<(Option<Snapshot>, Vec<EventEnvelope>)> {
        if let Some(snapshot) = self.load_snapshot(aggregate_id).await? {
            let events = self
                .load_events(aggregate_id, snapshot.replay_from())
                .await?;
            Ok((Some(snapshot), events))
        } else {
            let events = self.load_all_events(aggregate_id).await?;
            Ok((None, events))
        }
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a commit batch before touching storage.
///
/// - every event belongs to `aggregate_id`
/// - sequence numbers continue from `expected_version` without gaps
/// - there is exactly one outbox entry per event, owned by that event
pub fn validate_commit(
    aggregate_id: AggregateId,
    expected_version: Version,
    events: &[EventEnvelope],
    outbox: &[OutboxEntry],
) -> Result<()> {
    if events.is_empty() {
        return Err(EventStoreError::InvalidCommit(
            "cannot commit an empty event list".to_string(),
        ));
    }

    let mut next = expected_version.next();
    for event in events {
        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidCommit(format!(
                "event {} belongs to aggregate {}, not {}",
                event.event_id, event.aggregate_id, aggregate_id
            )));
        }
        if event.aggregate_type != events[0].aggregate_type {
            return Err(EventStoreError::InvalidCommit(
                "all events must have the same aggregate type".to_string(),
            ));
        }
        if event.version != next {
            return Err(EventStoreError::InvalidCommit(format!(
                "event sequence numbers must be contiguous: expected {}, got {}",
                next, event.version
            )));
        }
        next = next.next();
    }

    if outbox.len() != events.len() {
        return Err(EventStoreError::InvalidCommit(format!(
            "{} outbox entries for {} events",
            outbox.len(),
            events.len()
        )));
    }

    let event_ids: HashSet<EventId> = events.iter().map(|e| e.event_id).collect();
    let mut owners = HashSet::with_capacity(outbox.len());
    for entry in outbox {
        if !event_ids.contains(&entry.event_id) || !owners.insert(entry.event_id) {
            return Err(EventStoreError::InvalidCommit(format!(
                "outbox entry {} is not owned by exactly one event in the batch",
                entry.message_id
            )));
        }
    }

    Ok(())
}
