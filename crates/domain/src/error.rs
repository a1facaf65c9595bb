//! Domain error types.

use common::AggregateId;
use event_store::{EventStoreError, Version};
use thiserror::Error;

use crate::upcast::UpcastError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A business rule rejected the operation. No events were raised.
    #[error("{aggregate_type} rejected the operation: {source}")]
    Rejected {
        aggregate_type: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The stored event stream has a gap or does not line up with the snapshot.
    #[error(
        "Inconsistent event stream for {aggregate_id}: expected version {expected}, found {found}"
    )]
    Consistency {
        aggregate_id: AggregateId,
        expected: Version,
        found: Version,
    },

    /// The snapshot belongs to a different aggregate.
    #[error(
        "Snapshot of {found_type} {found_id} cannot restore {aggregate_type} {aggregate_id}"
    )]
    SnapshotMismatch {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
        found_type: String,
        found_id: AggregateId,
    },

    /// An old event could not be migrated to the current schema.
    #[error("Upcast failed: {0}")]
    Upcast(#[from] UpcastError),

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Aggregate not found.
    #[error("Aggregate not found: {aggregate_type} with id {aggregate_id}")]
    AggregateNotFound {
        aggregate_type: &'static str,
        aggregate_id: AggregateId,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Wraps an aggregate's own rule violation.
    pub fn rejected<E>(aggregate_type: &'static str, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DomainError::Rejected {
            aggregate_type,
            source: Box::new(error),
        }
    }

    /// Returns the aggregate's rule violation if this is a rejection of type `E`.
    pub fn rejection<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            DomainError::Rejected { source, .. } => source.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// True when the write lost an optimistic-concurrency race and the whole
    /// operation should be retried from a fresh load.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, DomainError::EventStore(e) if e.is_concurrency_conflict())
    }
}

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
