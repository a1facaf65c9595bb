//! Outbox publisher that wakes the saga manager.

use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use event_store::{OutboxEntry, PublishError, Publisher, SagaStore};

use crate::manager::SagaManager;
use crate::port::CommandPort;

/// Triggers the saga named in an event's `saga_id` metadata.
///
/// Events raised by saga steps carry the saga's id, so once the outbox
/// dispatches them the saga advances without waiting for the next poll.
/// Events without the key are acknowledged untouched.
pub struct SagaTriggerPublisher<S, P>
where
    S: SagaStore,
    P: CommandPort,
{
    manager: Arc<SagaManager<S, P>>,
}

impl<S, P> SagaTriggerPublisher<S, P>
where
    S: SagaStore,
    P: CommandPort,
{
    pub fn new(manager: Arc<SagaManager<S, P>>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<S, P> Publisher for SagaTriggerPublisher<S, P>
where
    S: SagaStore,
    P: CommandPort,
{
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        let Some(value) = entry.metadata("saga_id") else {
            return Ok(());
        };
        let saga_id: SagaId = serde_json::from_value(value.clone()).map_err(|e| {
            PublishError::Permanent(format!("malformed saga_id metadata {value}: {e}"))
        })?;

        tracing::debug!(%saga_id, event_type = %entry.event_type, "event triggers saga");
        self.manager.trigger(saga_id);
        Ok(())
    }
}
