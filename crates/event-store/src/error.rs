use thiserror::Error;

use crate::{AggregateId, EventId, SagaId, Version};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// A concurrency conflict occurred when committing events.
    /// The expected version did not match the actual version.
    #[error(
        "Concurrency conflict for aggregate {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: AggregateId,
        expected: Version,
        actual: Version,
    },

    /// A saga instance was saved against a stale version.
    #[error("Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    SagaConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `commit` is malformed (gaps, mixed aggregates,
    /// outbox entries that do not match the events one-to-one).
    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    /// An outbox entry referenced by the dispatcher does not exist.
    #[error("Outbox entry not found for event {0}")]
    OutboxEntryNotFound(EventId),

    /// A fault injected by a test adapter aborted the operation.
    #[error("Injected fault: {0}")]
    InjectedFault(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for stale-version failures on aggregates or saga records.
    ///
    /// Callers must reload and retry the whole operation.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self,
            EventStoreError::ConcurrencyConflict { .. }
                | EventStoreError::SagaConcurrencyConflict { .. }
        )
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
