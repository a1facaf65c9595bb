//! Request-scoped context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CorrelationId, SagaId};

/// Context carried explicitly through every call that persists events or
/// talks to an external port.
///
/// Events raised while handling a request are stamped with the context's
/// correlation and causation IDs, and its tenant/user/saga fields are copied
/// into the event metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub correlation_id: CorrelationId,
    pub causation_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub saga_id: Option<SagaId>,
}

impl RequestContext {
    /// Starts a new request with a fresh correlation ID.
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            causation_id: None,
            tenant_id: None,
            user_id: None,
            saga_id: None,
        }
    }

    /// Starts a request that continues an existing correlation.
    pub fn with_correlation(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..Self::new()
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    /// Derives a context for work caused by `cause` (an event, command or saga
    /// step), keeping the correlation and identity fields.
    pub fn caused_by(&self, cause: Uuid) -> Self {
        Self {
            causation_id: Some(cause),
            ..self.clone()
        }
    }

    /// Metadata entries to attach to events raised under this context.
    pub fn metadata(&self) -> HashMap<String, serde_json::Value> {
        let mut metadata = HashMap::new();
        if let Some(tenant) = &self.tenant_id {
            metadata.insert("tenant_id".to_string(), serde_json::json!(tenant));
        }
        if let Some(user) = &self.user_id {
            metadata.insert("user_id".to_string(), serde_json::json!(user));
        }
        if let Some(saga_id) = self.saga_id {
            metadata.insert("saga_id".to_string(), serde_json::json!(saga_id));
        }
        metadata
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
