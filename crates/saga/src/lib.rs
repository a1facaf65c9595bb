//! Saga orchestration over the event store.
//!
//! A saga is an ordered list of steps, each an action with an optional
//! compensation, executed through a [`CommandPort`]. The [`SagaManager`]
//! persists every instance as a [`SagaInstance`] record and advances it one
//! step at a time: transient failures are retried with backoff, and once a
//! step fails for good the completed steps are compensated in reverse order.
//!
//! [`TccCoordinator`] covers the two-phase variant, where each participant
//! reserves first and is then confirmed or cancelled as a group. Its
//! transactions share the saga record store and are resumed from it.

pub mod definition;
pub mod error;
pub mod executor;
pub mod instance;
pub mod manager;
pub mod port;
pub mod retry;
pub mod state;
pub mod tcc;
pub mod trigger;

pub use definition::{CommandRef, SagaDefinition, StepDefinition};
pub use error::{Result, SagaError};
pub use executor::{Progress, SagaExecutor};
pub use instance::{SagaInstance, StepOutcome, StepPhase, StepRecord};
pub use manager::{SagaManager, SagaManagerConfig};
pub use port::{CommandCall, CommandPort, ScriptedCommandPort, StepFailure, StepResult};
pub use retry::RetryPolicy;
pub use state::SagaState;
pub use tcc::{
    ParticipantPhase, ParticipantRecord, TCC_SAGA_TYPE, TccConfig, TccCoordinator,
    TccParticipant, TccState, TccTransaction,
};
pub use trigger::SagaTriggerPublisher;
