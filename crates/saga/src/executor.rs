//! Drives one saga instance through its state machine.

use chrono::{DateTime, Utc};

use crate::definition::{CommandRef, SagaDefinition, StepDefinition};
use crate::instance::{SagaInstance, StepOutcome, StepPhase, StepRecord};
use crate::port::{CommandPort, StepFailure};
use crate::state::SagaState;

/// What a single [`SagaExecutor::step`] achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A step or compensation finished; more work is due now.
    Advanced,
    /// A retry is scheduled for the given time.
    Waiting(DateTime<Utc>),
    /// The instance is in a terminal state.
    Finished(SagaState),
}

/// Executes actions and compensations through a [`CommandPort`] and applies
/// the outcome to the instance. Persistence is the caller's concern.
pub struct SagaExecutor<P: CommandPort> {
    port: P,
}

impl<P: CommandPort> SagaExecutor<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    /// Runs at most one action or compensation of `instance`.
    ///
    /// Cancellation requests are honoured here, before the next action
    /// starts; an action already handed to the port is never interrupted.
    #[tracing::instrument(
        skip(self, definition, instance, now),
        fields(saga_id = %instance.saga_id, step = instance.current_step_index)
    )]
    pub async fn step(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        now: DateTime<Utc>,
    ) -> Progress {
        instance.updated_at = now;
        match instance.state {
            SagaState::Running => self.run_action(definition, instance, now).await,
            SagaState::Compensating => self.run_compensation(definition, instance, now).await,
            terminal => Progress::Finished(terminal),
        }
    }

    /// Steps the instance until it finishes or has to wait for a retry.
    pub async fn run_until_blocked(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
    ) -> Progress {
        loop {
            if instance.is_terminal() {
                return Progress::Finished(instance.state);
            }
            let now = Utc::now();
            match instance.next_retry_at {
                Some(at) if at > now => return Progress::Waiting(at),
                _ => {}
            }
            self.step(definition, instance, now).await;
        }
    }

    async fn run_action(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        now: DateTime<Utc>,
    ) -> Progress {
        if instance.cancel_requested {
            tracing::info!("cancellation requested, compensating completed steps");
            instance
                .failure_reason
                .get_or_insert_with(|| "cancelled on request".to_string());
            return begin_compensation(instance);
        }

        let index = instance.current_step_index;
        let Some(step) = definition.steps.get(index) else {
            if index == definition.len() {
                return finish(instance, SagaState::Completed);
            }
            instance.failure_reason = Some(format!(
                "definition {} has no step {index}",
                definition.saga_type
            ));
            return finish(instance, SagaState::Failed);
        };

        let attempt = instance.attempt + 1;
        match self.call(instance, step, &step.action).await {
            Ok(output) => {
                record(instance, step, StepPhase::Action, attempt, StepOutcome::Succeeded, None, now);
                instance.record_output(&step.step_id, output);
                instance.current_step_index += 1;
                instance.attempt = 0;
                instance.next_retry_at = None;
                tracing::debug!(step_id = %step.step_id, attempt, "saga step succeeded");

                if instance.current_step_index == definition.len() {
                    return finish(instance, SagaState::Completed);
                }
                Progress::Advanced
            }
            Err(StepFailure::Transient(reason)) if step.retry_policy.allows_retry(attempt) => {
                schedule_retry(instance, step, StepPhase::Action, attempt, reason, now)
            }
            Err(failure) => {
                record(
                    instance,
                    step,
                    StepPhase::Action,
                    attempt,
                    StepOutcome::Failed,
                    Some(failure.to_string()),
                    now,
                );
                tracing::warn!(step_id = %step.step_id, attempt, error = %failure, "saga step failed, compensating");
                instance.failure_reason = Some(format!("step {} failed: {failure}", step.step_id));
                begin_compensation(instance)
            }
        }
    }

    async fn run_compensation(
        &self,
        definition: &SagaDefinition,
        instance: &mut SagaInstance,
        now: DateTime<Utc>,
    ) -> Progress {
        let Some(index) = instance.current_step_index.checked_sub(1) else {
            return finish(instance, SagaState::Cancelled);
        };
        let Some(step) = definition.steps.get(index) else {
            instance.failure_reason = Some(format!(
                "definition {} has no step {index} to compensate",
                definition.saga_type
            ));
            return finish(instance, SagaState::Failed);
        };

        let Some(compensation) = &step.compensation else {
            tracing::debug!(step_id = %step.step_id, "no compensation defined, skipping");
            return compensated(instance);
        };

        let attempt = instance.attempt + 1;
        match self.call(instance, step, compensation).await {
            Ok(_) => {
                record(
                    instance,
                    step,
                    StepPhase::Compensation,
                    attempt,
                    StepOutcome::Succeeded,
                    None,
                    now,
                );
                tracing::debug!(step_id = %step.step_id, attempt, "compensation succeeded");
                compensated(instance)
            }
            Err(StepFailure::Transient(reason)) if step.retry_policy.allows_retry(attempt) => {
                schedule_retry(instance, step, StepPhase::Compensation, attempt, reason, now)
            }
            Err(failure) => {
                record(
                    instance,
                    step,
                    StepPhase::Compensation,
                    attempt,
                    StepOutcome::Failed,
                    Some(failure.to_string()),
                    now,
                );
                tracing::error!(
                    step_id = %step.step_id,
                    attempt,
                    error = %failure,
                    "compensation failed permanently, operator intervention required"
                );
                instance.failure_reason =
                    Some(format!("compensation of {} failed: {failure}", step.step_id));
                finish(instance, SagaState::Failed)
            }
        }
    }

    async fn call(
        &self,
        instance: &SagaInstance,
        step: &StepDefinition,
        command: &CommandRef,
    ) -> Result<serde_json::Value, StepFailure> {
        let ctx = instance.step_context();
        tokio::time::timeout(step.timeout, self.port.execute(&ctx, command, &instance.context))
            .await
            .unwrap_or_else(|_| {
                Err(StepFailure::transient(format!(
                    "{} timed out after {:?}",
                    command.name, step.timeout
                )))
            })
    }
}

fn record(
    instance: &mut SagaInstance,
    step: &StepDefinition,
    phase: StepPhase,
    attempt: u32,
    outcome: StepOutcome,
    error: Option<String>,
    at: DateTime<Utc>,
) {
    let phase_label = match phase {
        StepPhase::Action => "action",
        StepPhase::Compensation => "compensation",
    };
    let outcome_label = match outcome {
        StepOutcome::Succeeded => "succeeded",
        StepOutcome::Retrying => "retrying",
        StepOutcome::Failed => "failed",
    };
    metrics::counter!("saga_steps_total", "phase" => phase_label, "outcome" => outcome_label)
        .increment(1);

    instance.step_history.push(StepRecord {
        step_id: step.step_id.clone(),
        phase,
        attempt,
        outcome,
        error,
        at,
    });
}

fn schedule_retry(
    instance: &mut SagaInstance,
    step: &StepDefinition,
    phase: StepPhase,
    attempt: u32,
    reason: String,
    now: DateTime<Utc>,
) -> Progress {
    let delay = step.retry_policy.delay(attempt);
    let at = chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    tracing::warn!(
        step_id = %step.step_id,
        attempt,
        delay_ms = delay.as_millis() as u64,
        error = %reason,
        "transient failure, retry scheduled"
    );
    metrics::counter!("saga_retries_total").increment(1);

    record(instance, step, phase, attempt, StepOutcome::Retrying, Some(reason), now);
    instance.attempt = attempt;
    instance.next_retry_at = Some(at);
    Progress::Waiting(at)
}

fn begin_compensation(instance: &mut SagaInstance) -> Progress {
    instance.transition(SagaState::Compensating);
    instance.attempt = 0;
    instance.next_retry_at = None;
    if instance.current_step_index == 0 {
        return finish(instance, SagaState::Cancelled);
    }
    Progress::Advanced
}

fn compensated(instance: &mut SagaInstance) -> Progress {
    instance.current_step_index -= 1;
    instance.attempt = 0;
    instance.next_retry_at = None;
    if instance.current_step_index == 0 {
        return finish(instance, SagaState::Cancelled);
    }
    Progress::Advanced
}

fn finish(instance: &mut SagaInstance, state: SagaState) -> Progress {
    instance.next_retry_at = None;
    if instance.transition(state) {
        match state {
            SagaState::Completed => {
                metrics::counter!("saga_completed_total").increment(1);
                tracing::info!(saga_id = %instance.saga_id, "saga completed");
            }
            SagaState::Cancelled => {
                metrics::counter!("saga_cancelled_total").increment(1);
                tracing::info!(
                    saga_id = %instance.saga_id,
                    reason = instance.failure_reason.as_deref().unwrap_or_default(),
                    "saga cancelled after compensation"
                );
            }
            SagaState::Failed => {
                metrics::counter!("saga_failed_total").increment(1);
                tracing::error!(
                    saga_id = %instance.saga_id,
                    reason = instance.failure_reason.as_deref().unwrap_or_default(),
                    "saga failed"
                );
            }
            SagaState::Running | SagaState::Compensating => {}
        }
    }
    Progress::Finished(instance.state)
}
