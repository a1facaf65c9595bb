//! Command/participant port used by saga steps.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{RequestContext, SagaId};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::definition::CommandRef;

/// Why a step, compensation or participant call did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepFailure {
    /// May succeed if retried.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Will never succeed; retrying is pointless.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl StepFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        StepFailure::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        StepFailure::Permanent(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StepFailure::Transient(_))
    }
}

/// Outcome of a port call: the step output on success.
pub type StepResult = Result<serde_json::Value, StepFailure>;

/// Executes saga actions and compensations.
///
/// Commands are identified by name and must be idempotent: the engine
/// delivers them at least once.
#[async_trait]
pub trait CommandPort: Send + Sync {
    /// Runs `command`. `saga_context` holds the saga's accumulated step outputs.
    async fn execute(
        &self,
        ctx: &RequestContext,
        command: &CommandRef,
        saga_context: &serde_json::Value,
    ) -> StepResult;
}

#[async_trait]
impl<P: CommandPort + ?Sized> CommandPort for Arc<P> {
    async fn execute(
        &self,
        ctx: &RequestContext,
        command: &CommandRef,
        saga_context: &serde_json::Value,
    ) -> StepResult {
        (**self).execute(ctx, command, saga_context).await
    }
}

/// A call received by [`ScriptedCommandPort`].
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCall {
    pub name: String,
    pub input: serde_json::Value,
    pub saga_id: Option<SagaId>,
}

#[derive(Debug, Default)]
struct ScriptState {
    outcomes: HashMap<String, VecDeque<StepResult>>,
    delays: HashMap<String, Duration>,
    calls: Vec<CommandCall>,
}

/// Command port that answers from per-command scripts.
///
/// Each call pops the next scripted outcome for its command name; once the
/// script is exhausted the command succeeds with `{"command": name}`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommandPort {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedCommandPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends outcomes for the next calls of `name`.
    pub async fn script(&self, name: &str, outcomes: impl IntoIterator<Item = StepResult>) {
        self.state
            .lock()
            .await
            .outcomes
            .entry(name.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Makes every call of `name` take at least `delay`.
    pub async fn delay(&self, name: &str, delay: Duration) {
        self.state
            .lock()
            .await
            .delays
            .insert(name.to_string(), delay);
    }

    pub async fn calls(&self) -> Vec<CommandCall> {
        self.state.lock().await.calls.clone()
    }

    /// Command names in call order.
    pub async fn call_names(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    pub async fn call_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.name == name)
            .count()
    }
}

#[async_trait]
impl CommandPort for ScriptedCommandPort {
    async fn execute(
        &self,
        ctx: &RequestContext,
        command: &CommandRef,
        _saga_context: &serde_json::Value,
    ) -> StepResult {
        let (outcome, delay) = {
            let mut state = self.state.lock().await;
            state.calls.push(CommandCall {
                name: command.name.clone(),
                input: command.input.clone(),
                saga_id: ctx.saga_id,
            });
            let outcome = state
                .outcomes
                .get_mut(&command.name)
                .and_then(VecDeque::pop_front);
            (outcome, state.delays.get(&command.name).copied())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        outcome.unwrap_or_else(|| Ok(serde_json::json!({ "command": command.name })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let port = ScriptedCommandPort::new();
        port.script(
            "charge",
            [Err(StepFailure::transient("timeout")), Ok(json!({"id": 7}))],
        )
        .await;

        let ctx = RequestContext::new();
        let cmd = CommandRef::new("charge", json!({"amount": 10}));
        let saga_ctx = json!({});

        assert_eq!(
            port.execute(&ctx, &cmd, &saga_ctx).await,
            Err(StepFailure::Transient("timeout".into()))
        );
        assert_eq!(port.execute(&ctx, &cmd, &saga_ctx).await, Ok(json!({"id": 7})));
        assert_eq!(
            port.execute(&ctx, &cmd, &saga_ctx).await,
            Ok(json!({"command": "charge"}))
        );
        assert_eq!(port.call_count("charge").await, 3);
        assert_eq!(port.calls().await[0].input, json!({"amount": 10}));
    }

    #[test]
    fn failure_kinds() {
        assert!(StepFailure::transient("x").is_transient());
        assert!(!StepFailure::permanent("x").is_transient());
    }
}
