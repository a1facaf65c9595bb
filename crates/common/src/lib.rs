//! Shared identifier types and the request-scoped context threaded through
//! every persistence and saga call.

pub mod context;
pub mod types;

pub use context::RequestContext;
pub use types::{AggregateId, CorrelationId, SagaId};
