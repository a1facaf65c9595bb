//! Saga instance: progress of one workflow run.

use chrono::{DateTime, Utc};
use common::{CorrelationId, RequestContext, SagaId};
use event_store::{SagaRecord, Version};
use serde::{Deserialize, Serialize};

use crate::state::SagaState;

/// Whether a history entry belongs to the forward or the rollback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepPhase {
    Action,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    /// Failed transiently; another attempt is scheduled.
    Retrying,
    /// Failed permanently, or transiently with no attempts left.
    Failed,
}

/// One attempted action or compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub phase: StepPhase,
    pub attempt: u32,
    pub outcome: StepOutcome,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// The durable state of one saga run.
///
/// While `Running`, `current_step_index` is the next action to execute.
/// While `Compensating`, it counts the completed steps still to undo: the
/// next compensation belongs to step `current_step_index - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub current_step_index: usize,
    pub state: SagaState,
    pub step_history: Vec<StepRecord>,
    /// Initial input plus each step's output under its `step_id`.
    pub context: serde_json::Value,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Attempts made so far on the current action or compensation.
    pub attempt: u32,
    pub cancel_requested: bool,
    pub failure_reason: Option<String>,
    /// Context of the request that started the saga.
    pub origin: RequestContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stored version, for optimistic locking of saves.
    #[serde(skip)]
    pub version: Version,
}

impl SagaInstance {
    /// A fresh instance at step 0 in `Running`.
    pub fn new(saga_type: impl Into<String>, origin: &RequestContext, input: serde_json::Value) -> Self {
        let saga_id = SagaId::new();
        let now = Utc::now();
        let context = match input {
            serde_json::Value::Object(_) => input,
            serde_json::Value::Null => serde_json::json!({}),
            other => serde_json::json!({ "input": other }),
        };
        Self {
            saga_id,
            saga_type: saga_type.into(),
            correlation_id: origin.correlation_id,
            current_step_index: 0,
            state: SagaState::Running,
            step_history: Vec::new(),
            context,
            next_retry_at: None,
            attempt: 0,
            cancel_requested: false,
            failure_reason: None,
            origin: origin.clone().saga(saga_id),
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Non-terminal and not waiting for a retry deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Context for commands issued by this saga's steps.
    pub fn step_context(&self) -> RequestContext {
        self.origin.caused_by(self.saga_id.as_uuid())
    }

    /// Moves to `next`, ignoring transitions the state machine forbids.
    ///
    /// Returns whether the state changed.
    pub fn transition(&mut self, next: SagaState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                saga_id = %self.saga_id,
                from = %self.state,
                to = %next,
                "illegal saga transition ignored"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Records a step output under its id.
    pub fn record_output(&mut self, step_id: &str, output: serde_json::Value) {
        if let serde_json::Value::Object(map) = &mut self.context {
            map.insert(step_id.to_string(), output);
        }
    }

    pub fn history_for(&self, step_id: &str) -> impl Iterator<Item = &StepRecord> {
        self.step_history.iter().filter(move |r| r.step_id == step_id)
    }

    pub fn to_record(&self) -> Result<SagaRecord, serde_json::Error> {
        Ok(SagaRecord {
            saga_id: self.saga_id,
            saga_type: self.saga_type.clone(),
            correlation_id: self.correlation_id,
            state: self.state.to_string(),
            is_terminal: self.is_terminal(),
            next_retry_at: self.next_retry_at,
            version: self.version,
            body: serde_json::to_value(self)?,
            updated_at: self.updated_at,
        })
    }

    pub fn from_record(record: &SagaRecord) -> Result<Self, serde_json::Error> {
        let mut instance: SagaInstance = serde_json::from_value(record.body.clone())?;
        instance.version = record.version;
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn new_instance_starts_running_at_step_zero() {
        let ctx = RequestContext::new().tenant("acme");
        let instance = SagaInstance::new("Transfer", &ctx, json!({"amount": 5}));

        assert_eq!(instance.state, SagaState::Running);
        assert_eq!(instance.current_step_index, 0);
        assert_eq!(instance.correlation_id, ctx.correlation_id);
        assert_eq!(instance.origin.saga_id, Some(instance.saga_id));
        assert_eq!(instance.context, json!({"amount": 5}));
        assert!(instance.is_due(Utc::now()));
    }

    #[test]
    fn scalar_input_is_wrapped() {
        let instance = SagaInstance::new("T", &RequestContext::new(), json!(42));
        assert_eq!(instance.context, json!({"input": 42}));
    }

    #[test]
    fn retry_deadline_controls_due() {
        let mut instance = SagaInstance::new("T", &RequestContext::new(), json!({}));
        let now = Utc::now();
        instance.next_retry_at = Some(now + Duration::seconds(10));
        assert!(!instance.is_due(now));
        assert!(instance.is_due(now + Duration::seconds(10)));
    }

    #[test]
    fn illegal_transition_is_ignored() {
        let mut instance = SagaInstance::new("T", &RequestContext::new(), json!({}));
        assert!(!instance.transition(SagaState::Cancelled));
        assert_eq!(instance.state, SagaState::Running);

        assert!(instance.transition(SagaState::Compensating));
        assert!(instance.transition(SagaState::Cancelled));
        assert!(!instance.transition(SagaState::Running));
        assert!(!instance.is_due(Utc::now()));
    }

    #[test]
    fn record_roundtrip_keeps_store_version() {
        let mut instance = SagaInstance::new("T", &RequestContext::new(), json!({}));
        instance.record_output("debit", json!({"hold": "h1"}));
        let mut record = instance.to_record().unwrap();
        record.version = Version::new(4);

        let restored = SagaInstance::from_record(&record).unwrap();
        assert_eq!(restored.version, Version::new(4));
        assert_eq!(restored.context["debit"]["hold"], "h1");
        assert_eq!(record.state, "Running");
        assert!(!record.is_terminal);
    }
}
