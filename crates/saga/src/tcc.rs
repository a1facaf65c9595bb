//! Try-Confirm-Cancel coordinator.
//!
//! Every participant is asked to reserve (Try). If all reservations hold they
//! are confirmed; otherwise every reservation that was made, or may have been
//! made, is cancelled. A confirmed reservation is never cancelled: Confirm is
//! retried until the participant accepts it.
//!
//! Transactions are stored as saga records of type [`TCC_SAGA_TYPE`] and
//! saved after every participant call, so a restarted coordinator can
//! [`resume`](TccCoordinator::resume) one from its last recorded phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CorrelationId, RequestContext, SagaId};
use event_store::{SagaRecord, SagaStore, Version};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, SagaError};
use crate::port::{StepFailure, StepResult};
use crate::retry::RetryPolicy;

/// Saga type under which TCC transactions are stored.
pub const TCC_SAGA_TYPE: &str = "tcc";

/// A resource manager enlisted in a TCC transaction.
///
/// All three phases must be idempotent for a given transaction id. Cancel
/// must also accept a transaction whose Try never arrived.
#[async_trait]
pub trait TccParticipant: Send + Sync {
    fn id(&self) -> &str;

    async fn try_reserve(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult;

    async fn confirm(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult;

    async fn cancel(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantPhase {
    NotStarted,
    Tried,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub participant_id: String,
    pub phase: ParticipantPhase,
    /// Calls made to the participant across all phases.
    pub calls: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TccState {
    Trying,
    Confirming,
    Cancelling,
    Completed,
    Cancelled,
    /// A reservation could not be cancelled; needs an operator.
    Failed,
}

impl TccState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TccState::Trying => "trying",
            TccState::Confirming => "confirming",
            TccState::Cancelling => "cancelling",
            TccState::Completed => "completed",
            TccState::Cancelled => "cancelled",
            TccState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TccState::Completed | TccState::Cancelled | TccState::Failed
        )
    }
}

/// Durable record of one TCC transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TccTransaction {
    pub transaction_id: SagaId,
    pub correlation_id: CorrelationId,
    pub state: TccState,
    pub participants: Vec<ParticipantRecord>,
    /// Caller data from which participants are rebuilt on recovery.
    pub input: serde_json::Value,
    /// Context every participant call runs under.
    pub origin: RequestContext,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub version: Version,
}

impl TccTransaction {
    fn new(
        ctx: &RequestContext,
        input: serde_json::Value,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Self {
        let transaction_id = SagaId::new();
        let now = Utc::now();
        Self {
            transaction_id,
            correlation_id: ctx.correlation_id,
            state: TccState::Trying,
            participants: participants
                .iter()
                .map(|p| ParticipantRecord {
                    participant_id: p.id().to_string(),
                    phase: ParticipantPhase::NotStarted,
                    calls: 0,
                    last_error: None,
                })
                .collect(),
            input,
            origin: ctx
                .clone()
                .saga(transaction_id)
                .caused_by(transaction_id.as_uuid()),
            failure_reason: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            version: Version::initial(),
        }
    }

    pub fn participant(&self, participant_id: &str) -> Option<&ParticipantRecord> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    pub fn to_record(&self) -> std::result::Result<SagaRecord, serde_json::Error> {
        Ok(SagaRecord {
            saga_id: self.transaction_id,
            saga_type: TCC_SAGA_TYPE.to_string(),
            correlation_id: self.correlation_id,
            state: self.state.as_str().to_string(),
            is_terminal: self.state.is_terminal(),
            next_retry_at: None,
            version: self.version,
            body: serde_json::to_value(self)?,
            updated_at: self.updated_at,
        })
    }

    pub fn from_record(record: &SagaRecord) -> std::result::Result<Self, serde_json::Error> {
        let mut tx: TccTransaction = serde_json::from_value(record.body.clone())?;
        tx.version = record.version;
        Ok(tx)
    }
}

#[derive(Debug, Clone)]
pub struct TccConfig {
    /// Upper bound on every single participant call.
    pub try_timeout: Duration,
    /// Governs Cancel retries and the Confirm backoff.
    pub retry_policy: RetryPolicy,
    /// Maximum transactions picked up per recovery scan.
    pub batch_size: usize,
}

impl Default for TccConfig {
    fn default() -> Self {
        Self {
            try_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::default(),
            batch_size: 100,
        }
    }
}

enum TryOutcome {
    Reserved,
    Rejected(StepFailure),
    /// No answer in time; the reservation may or may not exist.
    TimedOut,
}

pub struct TccCoordinator<S: SagaStore> {
    store: S,
    config: TccConfig,
}

impl<S: SagaStore> TccCoordinator<S> {
    pub fn new(store: S, config: TccConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn transaction(&self, transaction_id: SagaId) -> Result<Option<TccTransaction>> {
        match self.store.load_saga_instance(transaction_id).await? {
            Some(record) if record.saga_type == TCC_SAGA_TYPE => {
                Ok(Some(TccTransaction::from_record(&record)?))
            }
            _ => Ok(None),
        }
    }

    /// Runs one transaction across `participants` and returns its final record.
    ///
    /// An error means the transaction could not be saved; it is left at its
    /// last stored phase for [`resume`](Self::resume).
    #[tracing::instrument(
        skip(self, ctx, input, participants),
        fields(correlation_id = %ctx.correlation_id, participants = participants.len())
    )]
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        input: serde_json::Value,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Result<TccTransaction> {
        let mut tx = TccTransaction::new(ctx, input, participants);
        self.save(&mut tx).await?;
        metrics::counter!("saga_started_total", "saga_type" => TCC_SAGA_TYPE).increment(1);

        let ctx = tx.origin.clone();
        let transaction_id = tx.transaction_id;
        let shared = Mutex::new(tx);
        try_join_all(
            participants
                .iter()
                .enumerate()
                .map(|(i, p)| self.try_participant(&ctx, &shared, i, p.as_ref())),
        )
        .await?;
        let mut tx = shared.into_inner();

        tx.state = if tx.failure_reason.is_some() {
            TccState::Cancelling
        } else {
            TccState::Confirming
        };
        self.save(&mut tx).await?;
        tracing::debug!(%transaction_id, state = tx.state.as_str(), "tcc try phase finished");

        self.drive(tx, participants).await
    }

    /// Finishes a stored transaction from its last recorded phase.
    ///
    /// A transaction interrupted while trying is cancelled: the outcome of
    /// its Try calls is unknown, so every participant gets a Cancel.
    #[tracing::instrument(skip(self, participants))]
    pub async fn resume(
        &self,
        transaction_id: SagaId,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Result<TccTransaction> {
        let mut tx = self
            .transaction(transaction_id)
            .await?
            .ok_or(SagaError::NotFound(transaction_id))?;

        if tx.state == TccState::Trying {
            tx.failure_reason
                .get_or_insert_with(|| "interrupted while trying".to_string());
            tx.state = TccState::Cancelling;
            self.save(&mut tx).await?;
        }
        tracing::info!(state = tx.state.as_str(), "resuming tcc transaction");
        self.drive(tx, participants).await
    }

    /// Resumes every unfinished transaction not saved for `stale_after`.
    ///
    /// `participants_for` rebuilds the participants from a stored
    /// transaction; transactions it cannot rebuild are skipped.
    pub async fn recover<F>(
        &self,
        stale_after: Duration,
        participants_for: F,
    ) -> Result<Vec<TccTransaction>>
    where
        F: Fn(&TccTransaction) -> Option<Vec<Arc<dyn TccParticipant>>>,
    {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self
            .store
            .due_saga_instances(now, usize::MAX)
            .await?
            .into_iter()
            .filter(|r| r.saga_type == TCC_SAGA_TYPE && r.updated_at <= cutoff)
            .take(self.config.batch_size);

        let mut finished = Vec::new();
        for record in stale {
            let tx = TccTransaction::from_record(&record)?;
            let Some(participants) = participants_for(&tx) else {
                tracing::error!(transaction_id = %tx.transaction_id, "cannot rebuild tcc participants, skipping");
                continue;
            };
            match self.resume(tx.transaction_id, &participants).await {
                Ok(tx) => finished.push(tx),
                Err(e) if e.is_concurrency_conflict() => {
                    tracing::warn!(transaction_id = %tx.transaction_id, "tcc transaction resumed elsewhere")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(finished)
    }

    async fn drive(
        &self,
        tx: TccTransaction,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Result<TccTransaction> {
        let mut tx = match tx.state {
            TccState::Confirming => self.confirm_all(tx, participants).await?,
            TccState::Cancelling => self.cancel_all(tx, participants).await?,
            _ => return Ok(tx),
        };

        tx.finished_at = Some(Utc::now());
        self.save(&mut tx).await?;

        let transaction_id = tx.transaction_id;
        metrics::counter!("tcc_transactions_total", "outcome" => tx.state.as_str()).increment(1);
        match tx.state {
            TccState::Failed => tracing::error!(
                %transaction_id,
                reason = tx.failure_reason.as_deref().unwrap_or_default(),
                "tcc transaction failed, reservations may be left behind"
            ),
            state => tracing::info!(%transaction_id, state = state.as_str(), "tcc transaction finished"),
        }
        Ok(tx)
    }

    async fn try_participant(
        &self,
        ctx: &RequestContext,
        shared: &Mutex<TccTransaction>,
        index: usize,
        participant: &dyn TccParticipant,
    ) -> Result<()> {
        let transaction_id = shared.lock().await.transaction_id;
        let outcome = match tokio::time::timeout(
            self.config.try_timeout,
            participant.try_reserve(ctx, transaction_id),
        )
        .await
        {
            Ok(Ok(_)) => TryOutcome::Reserved,
            Ok(Err(failure)) => TryOutcome::Rejected(failure),
            Err(_) => TryOutcome::TimedOut,
        };

        let mut tx = shared.lock().await;
        let record = &mut tx.participants[index];
        record.calls += 1;
        let reason = match outcome {
            TryOutcome::Reserved => {
                record.phase = ParticipantPhase::Tried;
                None
            }
            TryOutcome::Rejected(failure) => {
                // a rejected Try holds nothing
                record.phase = ParticipantPhase::Cancelled;
                Some(failure.to_string())
            }
            TryOutcome::TimedOut => Some(format!(
                "try timed out after {:?}",
                self.config.try_timeout
            )),
        };
        if let Some(reason) = reason {
            tracing::warn!(participant = participant.id(), error = %reason, "tcc try failed");
            let failure = format!("{}: {reason}", record.participant_id);
            record.last_error = Some(reason);
            tx.failure_reason.get_or_insert(failure);
        }
        self.save(&mut tx).await
    }

    async fn confirm_all(
        &self,
        tx: TccTransaction,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Result<TccTransaction> {
        let pending = outstanding(&tx, participants, ParticipantPhase::Confirmed)?;
        let ctx = tx.origin.clone();
        let shared = Mutex::new(tx);
        try_join_all(
            pending
                .iter()
                .map(|(i, p)| self.confirm_participant(&ctx, &shared, *i, p.as_ref())),
        )
        .await?;

        let mut tx = shared.into_inner();
        tx.state = TccState::Completed;
        Ok(tx)
    }

    /// Confirms until the participant accepts, saving after every call.
    async fn confirm_participant(
        &self,
        ctx: &RequestContext,
        shared: &Mutex<TccTransaction>,
        index: usize,
        participant: &dyn TccParticipant,
    ) -> Result<()> {
        let policy = &self.config.retry_policy;
        let transaction_id = shared.lock().await.transaction_id;
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let result = self.bounded(participant.confirm(ctx, transaction_id)).await;

            let mut tx = shared.lock().await;
            let record = &mut tx.participants[index];
            record.calls += 1;
            match result {
                Ok(_) => {
                    record.phase = ParticipantPhase::Confirmed;
                    return self.save(&mut tx).await;
                }
                Err(failure) => {
                    if failure.is_transient() {
                        tracing::warn!(participant = participant.id(), attempt, error = %failure, "tcc confirm failed, retrying");
                    } else {
                        tracing::error!(participant = participant.id(), attempt, error = %failure, "tcc confirm rejected, retrying");
                    }
                    record.last_error = Some(failure.to_string());
                    self.save(&mut tx).await?;
                }
            }
            drop(tx);

            metrics::counter!("saga_retries_total").increment(1);
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    async fn cancel_all(
        &self,
        tx: TccTransaction,
        participants: &[Arc<dyn TccParticipant>],
    ) -> Result<TccTransaction> {
        let pending = outstanding(&tx, participants, ParticipantPhase::Cancelled)?;
        let ctx = tx.origin.clone();
        let shared = Mutex::new(tx);
        try_join_all(
            pending
                .iter()
                .map(|(i, p)| self.cancel_participant(&ctx, &shared, *i, p.as_ref())),
        )
        .await?;

        let mut tx = shared.into_inner();
        let stuck: Vec<_> = tx
            .participants
            .iter()
            .filter(|p| p.phase != ParticipantPhase::Cancelled)
            .map(|p| p.participant_id.as_str())
            .collect();
        if stuck.is_empty() {
            tx.state = TccState::Cancelled;
        } else {
            tx.failure_reason = Some(format!("cancel failed for {}", stuck.join(", ")));
            tx.state = TccState::Failed;
        }
        Ok(tx)
    }

    /// Cancels with retries per policy, saving after every call. Gives up
    /// on a permanent failure or once the attempts are spent.
    async fn cancel_participant(
        &self,
        ctx: &RequestContext,
        shared: &Mutex<TccTransaction>,
        index: usize,
        participant: &dyn TccParticipant,
    ) -> Result<()> {
        let policy = &self.config.retry_policy;
        let transaction_id = shared.lock().await.transaction_id;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self.bounded(participant.cancel(ctx, transaction_id)).await;

            let mut tx = shared.lock().await;
            let record = &mut tx.participants[index];
            record.calls += 1;
            let retry = match result {
                Ok(_) => {
                    record.phase = ParticipantPhase::Cancelled;
                    false
                }
                Err(failure) => {
                    let retry = failure.is_transient() && policy.allows_retry(attempt);
                    if retry {
                        tracing::warn!(participant = participant.id(), attempt, error = %failure, "tcc cancel failed, retrying");
                    } else {
                        tracing::error!(participant = participant.id(), attempt, error = %failure, "tcc cancel failed, giving up");
                    }
                    record.last_error = Some(failure.to_string());
                    retry
                }
            };
            self.save(&mut tx).await?;
            if !retry {
                return Ok(());
            }
            drop(tx);

            metrics::counter!("saga_retries_total").increment(1);
            tokio::time::sleep(policy.delay(attempt)).await;
        }
    }

    async fn bounded(&self, call: impl std::future::Future<Output = StepResult>) -> StepResult {
        tokio::time::timeout(self.config.try_timeout, call)
            .await
            .unwrap_or_else(|_| {
                Err(StepFailure::transient(format!(
                    "timed out after {:?}",
                    self.config.try_timeout
                )))
            })
    }

    async fn save(&self, tx: &mut TccTransaction) -> Result<()> {
        tx.updated_at = Utc::now();
        tx.version = self
            .store
            .save_saga_instance(tx.to_record()?, tx.version)
            .await?;
        Ok(())
    }
}

/// Participants whose record has not reached `target`, matched by id.
fn outstanding(
    tx: &TccTransaction,
    participants: &[Arc<dyn TccParticipant>],
    target: ParticipantPhase,
) -> Result<Vec<(usize, Arc<dyn TccParticipant>)>> {
    tx.participants
        .iter()
        .enumerate()
        .filter(|(_, record)| record.phase != target)
        .map(|(i, record)| {
            participants
                .iter()
                .find(|p| p.id() == record.participant_id)
                .map(|p| (i, Arc::clone(p)))
                .ok_or_else(|| {
                    SagaError::InvalidDefinition(format!(
                        "participant {} of transaction {} was not supplied",
                        record.participant_id, tx.transaction_id
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_store::InMemoryEventStore;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        outcomes: HashMap<&'static str, VecDeque<StepResult>>,
        calls: Vec<&'static str>,
        try_delay: Option<Duration>,
        confirm_delay: Option<Duration>,
    }

    struct TestParticipant {
        id: String,
        script: Mutex<Script>,
    }

    impl TestParticipant {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new(Script::default()),
            })
        }

        fn script(&self, phase: &'static str, outcomes: impl IntoIterator<Item = StepResult>) {
            self.script
                .lock()
                .unwrap()
                .outcomes
                .entry(phase)
                .or_default()
                .extend(outcomes);
        }

        fn slow_try(&self, delay: Duration) {
            self.script.lock().unwrap().try_delay = Some(delay);
        }

        fn slow_confirm(&self, delay: Option<Duration>) {
            self.script.lock().unwrap().confirm_delay = delay;
        }

        fn calls(&self) -> Vec<&'static str> {
            self.script.lock().unwrap().calls.clone()
        }

        fn next(&self, phase: &'static str) -> StepResult {
            let mut script = self.script.lock().unwrap();
            script.calls.push(phase);
            script
                .outcomes
                .get_mut(phase)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(serde_json::Value::Null))
        }
    }

    #[async_trait]
    impl TccParticipant for TestParticipant {
        fn id(&self) -> &str {
            &self.id
        }

        async fn try_reserve(&self, _ctx: &RequestContext, _tx: SagaId) -> StepResult {
            let delay = self.script.lock().unwrap().try_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.next("try")
        }

        async fn confirm(&self, _ctx: &RequestContext, _tx: SagaId) -> StepResult {
            let delay = self.script.lock().unwrap().confirm_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.next("confirm")
        }

        async fn cancel(&self, _ctx: &RequestContext, _tx: SagaId) -> StepResult {
            self.next("cancel")
        }
    }

    fn coordinator() -> TccCoordinator<InMemoryEventStore> {
        coordinator_over(InMemoryEventStore::new())
    }

    fn coordinator_over(store: InMemoryEventStore) -> TccCoordinator<InMemoryEventStore> {
        TccCoordinator::new(
            store,
            TccConfig {
                try_timeout: Duration::from_millis(100),
                retry_policy: RetryPolicy::immediate(3),
                ..TccConfig::default()
            },
        )
    }

    async fn stored(store: &InMemoryEventStore) -> TccTransaction {
        let records = store.due_saga_instances(Utc::now(), 10).await.unwrap();
        assert_eq!(records.len(), 1);
        TccTransaction::from_record(&records[0]).unwrap()
    }

    /// Waits until the stored transaction satisfies `done`.
    async fn stored_until(
        store: &InMemoryEventStore,
        done: impl Fn(&TccTransaction) -> bool,
    ) -> TccTransaction {
        for _ in 0..200 {
            if store.saga_count().await == 1 {
                let tx = stored(store).await;
                if done(&tx) {
                    return tx;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stored transaction never reached the expected phase");
    }

    fn phases(tx: &TccTransaction) -> Vec<ParticipantPhase> {
        tx.participants.iter().map(|p| p.phase).collect()
    }

    #[tokio::test]
    async fn all_reservations_are_confirmed() {
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Completed);
        assert_eq!(phases(&tx), vec![ParticipantPhase::Confirmed; 2]);
        assert_eq!(p1.calls(), vec!["try", "confirm"]);
        assert_eq!(p2.calls(), vec!["try", "confirm"]);
        assert!(tx.finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_try_cancels_only_reserved_participants() {
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p2.script("try", [Err(StepFailure::permanent("insufficient funds"))]);
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Cancelled);
        assert_eq!(phases(&tx), vec![ParticipantPhase::Cancelled; 2]);
        assert_eq!(p1.calls(), vec!["try", "cancel"]);
        assert_eq!(p2.calls(), vec!["try"]);
        assert!(tx.failure_reason.unwrap().starts_with("p2"));
    }

    #[tokio::test]
    async fn confirm_is_retried_on_the_failing_participant_only() {
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p2.script(
            "confirm",
            [
                Err(StepFailure::transient("db down")),
                Err(StepFailure::transient("db down")),
            ],
        );
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Completed);
        assert_eq!(p1.calls(), vec!["try", "confirm"]);
        assert_eq!(p2.calls(), vec!["try", "confirm", "confirm", "confirm"]);
        assert_eq!(tx.participant("p2").unwrap().calls, 4);
    }

    #[tokio::test]
    async fn confirm_outlasts_the_retry_budget() {
        let p1 = TestParticipant::new("p1");
        p1.script(
            "confirm",
            std::iter::repeat_with(|| Err(StepFailure::transient("flaky"))).take(10),
        );
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Completed);
        assert_eq!(p1.calls().len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_try_is_cancelled() {
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p2.slow_try(Duration::from_secs(1));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Cancelled);
        assert_eq!(p1.calls(), vec!["try", "cancel"]);
        // the slow try never completed
        assert_eq!(p2.calls(), vec!["cancel"]);
        assert!(tx.participant("p2").unwrap().last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unrecoverable_cancel_fails_the_transaction() {
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p1.script(
            "cancel",
            std::iter::repeat_with(|| Err(StepFailure::transient("down"))).take(3),
        );
        p2.script("try", [Err(StepFailure::permanent("no"))]);
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let tx = coordinator()
            .execute(&RequestContext::new(), json!({}), &participants)
            .await
            .unwrap();

        assert_eq!(tx.state, TccState::Failed);
        assert_eq!(p1.calls(), vec!["try", "cancel", "cancel", "cancel"]);
        assert_eq!(tx.participant("p1").unwrap().phase, ParticipantPhase::Tried);
        assert_eq!(tx.participant("p2").unwrap().phase, ParticipantPhase::Cancelled);
        assert!(tx.failure_reason.unwrap().contains("p1"));
    }

    #[tokio::test]
    async fn every_phase_is_stored() {
        let store = InMemoryEventStore::new();
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1, p2];

        let tx = coordinator_over(store.clone())
            .execute(&RequestContext::new(), json!({"amount": 5}), &participants)
            .await
            .unwrap();

        let record = store
            .load_saga_instance(tx.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.saga_type, TCC_SAGA_TYPE);
        assert_eq!(record.state, "completed");
        assert!(record.is_terminal);
        // created, two tries, phase switch, two confirms, finished
        assert_eq!(record.version, Version::new(7));
        assert_eq!(TccTransaction::from_record(&record).unwrap(), tx);
        assert_eq!(tx.input, json!({"amount": 5}));
    }

    #[tokio::test]
    async fn resumed_transaction_confirms_only_what_is_left() {
        let store = InMemoryEventStore::new();
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p2.slow_confirm(Some(Duration::from_secs(3600)));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let crashed = tokio::spawn({
            let store = store.clone();
            let participants = participants.clone();
            async move {
                coordinator_over(store)
                    .execute(&RequestContext::new(), json!({}), &participants)
                    .await
            }
        });
        let tx = stored_until(&store, |tx| {
            tx.participant("p1").unwrap().phase == ParticipantPhase::Confirmed
                && tx.participant("p2").unwrap().last_error.is_some()
        })
        .await;
        crashed.abort();
        assert_eq!(tx.state, TccState::Confirming);

        p2.slow_confirm(None);
        let resumed = coordinator_over(store.clone())
            .resume(tx.transaction_id, &participants)
            .await
            .unwrap();

        assert_eq!(resumed.state, TccState::Completed);
        assert_eq!(p1.calls(), vec!["try", "confirm"]);
        assert_eq!(p2.calls().last(), Some(&"confirm"));
        assert!(store.due_saga_instances(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recovery_cancels_a_transaction_interrupted_while_trying() {
        let store = InMemoryEventStore::new();
        let (p1, p2) = (TestParticipant::new("p1"), TestParticipant::new("p2"));
        p2.slow_try(Duration::from_secs(3600));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone(), p2.clone()];

        let crashed = tokio::spawn({
            let store = store.clone();
            let participants = participants.clone();
            async move {
                TccCoordinator::new(
                    store,
                    TccConfig {
                        try_timeout: Duration::from_secs(3600),
                        ..TccConfig::default()
                    },
                )
                .execute(&RequestContext::new(), json!({}), &participants)
                .await
            }
        });
        stored_until(&store, |tx| {
            tx.participant("p1").unwrap().phase == ParticipantPhase::Tried
        })
        .await;
        crashed.abort();

        let recovered = coordinator_over(store.clone())
            .recover(Duration::ZERO, |_| Some(participants.clone()))
            .await
            .unwrap();

        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, TccState::Cancelled);
        assert_eq!(recovered[0].failure_reason.as_deref(), Some("interrupted while trying"));
        assert_eq!(p1.calls(), vec!["try", "cancel"]);
        // its try never answered, so it is cancelled blind
        assert_eq!(p2.calls(), vec!["cancel"]);
    }

    #[tokio::test]
    async fn resume_requires_every_recorded_participant() {
        let store = InMemoryEventStore::new();
        let p1 = TestParticipant::new("p1");
        p1.slow_confirm(Some(Duration::from_secs(3600)));
        let participants: Vec<Arc<dyn TccParticipant>> = vec![p1.clone()];

        let crashed = tokio::spawn({
            let store = store.clone();
            let participants = participants.clone();
            async move {
                coordinator_over(store)
                    .execute(&RequestContext::new(), json!({}), &participants)
                    .await
            }
        });
        let tx = stored_until(&store, |tx| tx.state == TccState::Confirming).await;
        crashed.abort();

        let err = coordinator_over(store)
            .resume(tx.transaction_id, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition(_)));
    }
}
