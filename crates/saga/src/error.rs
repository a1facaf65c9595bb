//! Saga error types.
//!
//! Step and participant failures are not errors: they are recorded in the
//! saga's history and drive its state machine. These errors cover storage
//! and configuration problems of the engine itself.

use common::SagaId;
use event_store::EventStoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// A saga definition is unusable.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The saga instance does not exist.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The trigger loop is already running or was shut down.
    #[error("Saga manager is already running")]
    AlreadyRunning,

    /// Event store error.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// True when a saga save lost an optimistic-locking race.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, SagaError::EventStore(e) if e.is_concurrency_conflict())
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
