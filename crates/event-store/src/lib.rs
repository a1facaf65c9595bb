//! Event log, transactional outbox and saga instance storage.
//!
//! The storage port is split into three traits that a single adapter
//! implements: [`EventStore`] (events, snapshots and the atomic commit),
//! [`OutboxStore`] (dispatcher side of the outbox) and [`SagaStore`]
//! (saga instance records with optimistic locking).

pub mod dispatch;
pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod saga_record;
pub mod snapshot;
pub mod store;

pub use common::{AggregateId, CorrelationId, RequestContext, SagaId};
pub use dispatch::{
    DispatchReport, DispatcherConfig, InMemoryPublisher, OutboxDispatcher, PublishError, Publisher,
};
pub use error::{EventStoreError, Result};
pub use event::{EventEnvelope, EventEnvelopeBuilder, EventId, Version};
pub use memory::{FaultPoint, InMemoryEventStore};
pub use outbox::{MessageId, OutboxEntry, OutboxStatus};
pub use postgres::PostgresEventStore;
pub use saga_record::SagaRecord;
pub use snapshot::Snapshot;
pub use store::{EventStore, EventStoreExt, OutboxStore, SagaStore};
