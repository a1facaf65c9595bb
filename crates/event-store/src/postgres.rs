use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AggregateId, CorrelationId, EventEnvelope, EventId, EventStoreError, MessageId, OutboxEntry,
    OutboxStatus, Result, SagaId, SagaRecord, Snapshot, Version,
    memory::FaultPoint,
    store::{EventStore, OutboxStore, SagaStore, validate_commit},
};

const EVENT_COLUMNS: &str = "id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, correlation_id, causation_id, payload, metadata";

const OUTBOX_COLUMNS: &str = "message_id, event_id, aggregate_id, event_type, version, payload, created_at, dispatched_at, status, attempts, last_error";

const SAGA_COLUMNS: &str =
    "saga_id, saga_type, correlation_id, state, is_terminal, next_retry_at, version, body, updated_at";

/// PostgreSQL-backed implementation of every storage port.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    fault: Arc<Mutex<Option<FaultPoint>>>,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fault: Arc::default(),
        }
    }

    /// Makes the next `commit` abort its transaction at `point`.
    pub async fn inject_fault(&self, point: FaultPoint) {
        *self.fault.lock().await = Some(point);
    }

    async fn take_fault(&self, point: FaultPoint) -> Result<()> {
        let mut fault = self.fault.lock().await;
        if *fault == Some(point) {
            *fault = None;
            return Err(EventStoreError::InjectedFault(format!("{point:?}")));
        }
        Ok(())
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;
        let schema_version: i32 = row.try_get("schema_version")?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            version: Version::new(row.try_get("version")?),
            schema_version: schema_version.max(1) as u32,
            timestamp: row.try_get("timestamp")?,
            correlation_id: row
                .try_get::<Option<Uuid>, _>("correlation_id")?
                .map(CorrelationId::from_uuid),
            causation_id: row.try_get("causation_id")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
        let status: String = row.try_get("status")?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(OutboxEntry {
            message_id: MessageId::from_uuid(row.try_get::<Uuid, _>("message_id")?),
            aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            event_type: row.try_get("event_type")?,
            version: Version::new(row.try_get("version")?),
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Failed),
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }

    fn row_to_saga(row: PgRow) -> Result<SagaRecord> {
        Ok(SagaRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            state: row.try_get("state")?,
            is_terminal: row.try_get("is_terminal")?,
            next_retry_at: row.try_get("next_retry_at")?,
            version: Version::new(row.try_get("version")?),
            body: row.try_get("body")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_saga_version(&self, saga_id: SagaId) -> Result<Version> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(Version::new(version.unwrap_or(0)))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[tracing::instrument(skip(self, events, outbox), fields(events = events.len()))]
    async fn commit(
        &self,
        aggregate_id: AggregateId,
        expected_version: Version,
        events: Vec<EventEnvelope>,
        outbox: Vec<OutboxEntry>,
    ) -> Result<Version> {
        validate_commit(aggregate_id, expected_version, &events, &outbox)?;

        let mut tx = self.pool.begin().await?;
        self.take_fault(FaultPoint::BeforeCommit).await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;

        let actual = Version::new(current_version.unwrap_or(0));
        if actual != expected_version {
            metrics::counter!("concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut last_version = expected_version;
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO events (id, event_type, aggregate_id, aggregate_type, version, schema_version, timestamp, correlation_id, causation_id, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.version.as_i64())
            .bind(event.schema_version as i32)
            .bind(event.timestamp)
            .bind(event.correlation_id.map(|c| c.as_uuid()))
            .bind(event.causation_id)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer took the same sequence number first.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_aggregate_version")
                {
                    metrics::counter!("concurrency_conflicts_total").increment(1);
                    return EventStoreError::ConcurrencyConflict {
                        aggregate_id,
                        expected: expected_version,
                        actual: event.version,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_version = event.version;
        }

        // Dropping `tx` here rolls back the inserted events.
        self.take_fault(FaultPoint::AfterEventsAppended).await?;

        for entry in &outbox {
            sqlx::query(
                r#"
                INSERT INTO outbox (message_id, event_id, aggregate_id, event_type, version, payload, created_at, dispatched_at, status, attempts, last_error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(entry.message_id.as_uuid())
            .bind(entry.event_id.as_uuid())
            .bind(entry.aggregate_id.as_uuid())
            .bind(&entry.event_type)
            .bind(entry.version.as_i64())
            .bind(&entry.payload)
            .bind(entry.created_at)
            .bind(entry.dispatched_at)
            .bind(entry.status.as_str())
            .bind(entry.attempts as i32)
            .bind(&entry.last_error)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        metrics::counter!("events_committed_total").increment(events.len() as u64);
        Ok(last_version)
    }

    async fn load_events(
        &self,
        aggregate_id: AggregateId,
        from_version: Version,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 AND version >= $2 ORDER BY version ASC"
        ))
        .bind(aggregate_id.as_uuid())
        .bind(from_version.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn get_aggregate_version(&self, aggregate_id: AggregateId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM events WHERE aggregate_id = $1")
                .bind(aggregate_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        Ok(version.map(Version::new))
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, timestamp, state)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_id) DO UPDATE SET
                aggregate_type = EXCLUDED.aggregate_type,
                version = EXCLUDED.version,
                timestamp = EXCLUDED.timestamp,
                state = EXCLUDED.state
            WHERE snapshots.version < EXCLUDED.version
            "#,
        )
        .bind(snapshot.aggregate_id.as_uuid())
        .bind(&snapshot.aggregate_type)
        .bind(snapshot.version.as_i64())
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_snapshot(&self, aggregate_id: AggregateId) -> Result<Option<Snapshot>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, timestamp, state
            FROM snapshots
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Snapshot {
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
                state: row.try_get("state")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresEventStore {
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE status = 'pending' ORDER BY position ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, event_ids: &[EventId], at: DateTime<Utc>) -> Result<()> {
        let ids: Vec<Uuid> = event_ids.iter().map(|id| id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE outbox SET status = 'dispatched', dispatched_at = $2
            WHERE event_id = ANY($1) AND status <> 'dispatched'
            "#,
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dispatch_failure(
        &self,
        event_id: EventId,
        error: &str,
        permanent: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox SET
                attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN $3 THEN 'failed' ELSE status END
            WHERE event_id = $1 AND status <> 'dispatched'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .bind(permanent)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.outbox_entry(event_id).await?.is_none() {
            return Err(EventStoreError::OutboxEntryNotFound(event_id));
        }
        Ok(())
    }

    async fn outbox_entry(&self, event_id: EventId) -> Result<Option<OutboxEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE event_id = $1"
        ))
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_outbox).transpose()
    }
}

#[async_trait]
impl SagaStore for PostgresEventStore {
    async fn load_saga_instance(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_instances WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    #[tracing::instrument(skip(self, record), fields(saga_id = %record.saga_id))]
    async fn save_saga_instance(
        &self,
        record: SagaRecord,
        expected_version: Version,
    ) -> Result<Version> {
        let new_version = expected_version.next();
        let now = Utc::now();

        let result = if expected_version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO saga_instances (saga_id, saga_type, correlation_id, state, is_terminal, next_retry_at, version, body, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (saga_id) DO NOTHING
                "#,
            )
            .bind(record.saga_id.as_uuid())
            .bind(&record.saga_type)
            .bind(record.correlation_id.as_uuid())
            .bind(&record.state)
            .bind(record.is_terminal)
            .bind(record.next_retry_at)
            .bind(new_version.as_i64())
            .bind(&record.body)
            .bind(now)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE saga_instances SET
                    state = $2,
                    is_terminal = $3,
                    next_retry_at = $4,
                    version = $5,
                    body = $6,
                    updated_at = $7
                WHERE saga_id = $1 AND version = $8
                "#,
            )
            .bind(record.saga_id.as_uuid())
            .bind(&record.state)
            .bind(record.is_terminal)
            .bind(record.next_retry_at)
            .bind(new_version.as_i64())
            .bind(&record.body)
            .bind(now)
            .bind(expected_version.as_i64())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            metrics::counter!("concurrency_conflicts_total").increment(1);
            return Err(EventStoreError::SagaConcurrencyConflict {
                saga_id: record.saga_id,
                expected: expected_version,
                actual: self.current_saga_version(record.saga_id).await?,
            });
        }

        Ok(new_version)
    }

    async fn due_saga_instances(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {SAGA_COLUMNS} FROM saga_instances
            WHERE NOT is_terminal AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY COALESCE(next_retry_at, updated_at) ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_saga).collect()
    }
}
