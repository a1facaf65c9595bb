//! Static saga definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Upper bound on a single action or compensation call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

fn default_step_timeout() -> Duration {
    DEFAULT_STEP_TIMEOUT
}

/// An opaque command for the command port: a name plus structured input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRef {
    pub name: String,
    pub input: serde_json::Value,
}

impl CommandRef {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
        }
    }
}

/// One step of a saga: the action to run and how to undo it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub step_id: String,
    pub action: CommandRef,
    /// Steps without a compensation are skipped during rollback.
    pub compensation: Option<CommandRef>,
    pub retry_policy: RetryPolicy,
    /// A call that outlasts this counts as a transient failure.
    #[serde(default = "default_step_timeout")]
    pub timeout: Duration,
}

impl StepDefinition {
    pub fn new(step_id: impl Into<String>, action: CommandRef) -> Self {
        Self {
            step_id: step_id.into(),
            action,
            compensation: None,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn compensate_with(mut self, compensation: CommandRef) -> Self {
        self.compensation = Some(compensation);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Ordered steps of a saga type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub steps: Vec<StepDefinition>,
}

impl SagaDefinition {
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Checks that the definition has steps and that step ids are unique.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err(format!("saga type {} has no steps", self.saga_type));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(format!(
                    "saga type {} has duplicate step id {}",
                    self.saga_type, step.step_id
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_keeps_step_order() {
        let def = SagaDefinition::new("Transfer")
            .step(
                StepDefinition::new("debit", CommandRef::new("account.reserve", json!({})))
                    .compensate_with(CommandRef::new("account.release", json!({}))),
            )
            .step(StepDefinition::new(
                "credit",
                CommandRef::new("account.deposit", json!({})),
            ));

        assert_eq!(def.len(), 2);
        assert_eq!(def.steps[0].step_id, "debit");
        assert!(def.steps[0].compensation.is_some());
        assert!(def.steps[1].compensation.is_none());
        assert!(def.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_and_duplicate_steps() {
        assert!(SagaDefinition::new("Empty").validate().is_err());

        let dup = SagaDefinition::new("Dup")
            .step(StepDefinition::new("a", CommandRef::new("x", json!(null))))
            .step(StepDefinition::new("a", CommandRef::new("y", json!(null))));
        assert!(dup.validate().unwrap_err().contains("duplicate"));
    }
}
