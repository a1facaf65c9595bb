use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventId, EventStoreError, OutboxEntry, OutboxStatus, Result,
    SagaId, SagaRecord, Snapshot, Version,
    store::{EventStore, OutboxStore, SagaStore, validate_commit},
};

/// Point inside `commit` at which an injected fault aborts the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Before anything is staged.
    BeforeCommit,
    /// After the events are appended, before the outbox entries are.
    AfterEventsAppended,
}

#[derive(Default)]
struct Tables {
    events: Vec<EventEnvelope>,
    versions: HashMap<AggregateId, Version>,
    outbox: Vec<OutboxEntry>,
    snapshots: HashMap<AggregateId, Snapshot>,
    sagas: HashMap<SagaId, SagaRecord>,
    fault: Option<FaultPoint>,
}

/// In-memory implementation of every storage port.
///
/// All tables sit behind one lock, so a commit is a single critical section:
/// events, the version bump and the outbox entries become visible together.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `commit` fail at `point`.
    pub async fn inject_fault(&self, point: FaultPoint) {
        self.tables.write().await.fault = Some(point);
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Returns every outbox entry in commit order, whatever its status.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.tables.read().await.outbox.clone()
    }

    /// Returns the number of stored saga records.
    pub async fn saga_count(&self) -> usize {
        self.tables.read().await.sagas.len()
    }
}

fn take_fault(tables: &mut Tables, point: FaultPoint) -> Result<()> {
    if tables.fault == Some(point) {
        tables.fault = None;
        return Err(EventStoreError::InjectedFault(format!("{point:?}")));
    }
    Ok(())
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn commit(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<EventEnvelope>,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version> {
        validate_commit(aggregate_id, expected_version, &events, &outbox)?;

        let mut tables = self.tables.write().await;
        take_fault(&mut tables, FaultPoint::BeforeCommit)?;

        let actual = tables
            .versions
            .get(&aggregate_id)
            .copied()
            .unwrap_or(Version::initial());
        if actual != expected_version {
            metrics::counter!("concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let new_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(expected_version);
        let event_count = events.len();

        let events_mark = tables.events.len();
        let previous = tables.versions.get(&aggregate_id).copied();
        tables.events.extend(events);
        tables.versions.insert(aggregate_id, new_version);

        if let Err(e) = take_fault(&mut tables, FaultPoint::AfterEventsAppended) {
            tables.events.truncate(events_mark);
            match previous {
                Some(version) => tables.versions.insert(aggregate_id, version),
                None => tables.versions.remove(&aggregate_id),
            };
            return Err(e);
        }
        tables.outbox.extend(outbox);

        metrics::counter!("events_committed_total").increment(event_count as u64);
        Ok(new_version)
    }

    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let tables = self.tables.read().await;
        let mut events: Vec<_> = tables
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id && e.version >= from_version)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        Ok(self.tables.read().await.versions.get(&aggregate_id).copied())
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.snapshots.insert(snapshot.aggregate_id, snapshot);
        Ok(())
    }

    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>> {
        Ok(self.tables.read().await.snapshots.get(&aggregate_id).cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| e.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, event_ids: &[EventId], at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        for entry in tables
            .outbox
            .iter_mut()
            .filter(|e| event_ids.contains(&e.event_id))
        {
            if entry.status != OutboxStatus::Dispatched {
                entry.status = OutboxStatus::Dispatched;
                entry.dispatched_at = Some(at);
            }
        }
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        event_id: EventId,
        error: &str,
        permanent: bool,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or(EventStoreError::OutboxEntryNotFound(event_id))?;

        if entry.status == OutboxStatus::Dispatched {
            return Ok(());
        }
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        if permanent {
            entry.status = OutboxStatus::Failed;
        }
        Ok(())
    }

    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned())
    }
}

#[async_trait]
impl SagaStore for InMemoryEventStore {
    async fn load_saga_instance(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.tables.read().await.sagas.get(&saga_id).cloned())
    }

    async fn save_saga_instance(
        &self,
        mut record: SagaRecord,
        expected_version: Version,
    ) -> Result<Version> {
        let mut tables = self.tables.write().await;
        let actual = tables
            .sagas
            .get(&record.saga_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        if actual != expected_version {
            metrics::counter!("concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::SagaConcurrencyConflict {
                saga_id: record.saga_id,
                expected: expected_version,
                actual,
            });
        }

        let new_version = expected_version.next();
        record.version = new_version;
        record.updated_at = Utc::now();
        tables.sagas.insert(record.saga_id, record);
        Ok(new_version)
    }

    async fn due_saga_instances(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let tables = self.tables.read().await;
        let mut due: Vec<_> = tables
            .sagas
            .values()
            .filter(|r| r.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at.unwrap_or(r.updated_at));
        due.truncate(limit);
        Ok(due)
    }
}
