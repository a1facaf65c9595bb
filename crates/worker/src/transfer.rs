//! Money transfer between two accounts, as a saga and as a TCC transaction.

use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, RequestContext, SagaId};
use domain::{Account, Money, Repository};
use event_store::EventStore;
use saga::{
    CommandRef, RetryPolicy, SagaDefinition, StepDefinition, StepResult, TccParticipant,
    TccTransaction,
};
use serde_json::{Value, json};

use crate::commands::{self, step_failure};

pub const SAGA_TYPE: &str = "Transfer";

/// Saga context (or TCC input) for a transfer of `amount` from `from` to `to`.
pub fn input(from: AggregateId, to: AggregateId, amount: Money) -> Value {
    json!({ "from": from, "to": to, "amount": amount.cents() })
}

/// Hold on the payer, credit the payee, then settle the hold.
///
/// A failed credit releases the hold. Settling comes last and has no
/// compensation: once the payee is credited the transfer only moves forward.
pub fn definition(retry: RetryPolicy) -> SagaDefinition {
    SagaDefinition::new(SAGA_TYPE)
        .step(
            StepDefinition::new("hold", CommandRef::new(commands::RESERVE, json!({"account": "from"})))
                .compensate_with(CommandRef::new(commands::RELEASE, json!({"account": "from"})))
                .retry(retry.clone()),
        )
        .step(
            StepDefinition::new("credit", CommandRef::new(commands::DEPOSIT, json!({"account": "to"})))
                .compensate_with(CommandRef::new(commands::WITHDRAW, json!({"account": "to"})))
                .retry(retry.clone()),
        )
        .step(
            StepDefinition::new("settle", CommandRef::new(commands::CONFIRM, json!({"account": "from"})))
                .retry(retry),
        )
}

/// TCC participant that places, settles or drops a hold on the payer.
pub struct DebitParticipant<S: EventStore> {
    id: String,
    accounts: Arc<Repository<S, Account>>,
    account_id: AggregateId,
    amount: Money,
}

impl<S: EventStore> DebitParticipant<S> {
    pub fn new(accounts: Arc<Repository<S, Account>>, account_id: AggregateId, amount: Money) -> Self {
        Self {
            id: format!("debit:{account_id}"),
            accounts,
            account_id,
            amount,
        }
    }
}

#[async_trait]
impl<S: EventStore> TccParticipant for DebitParticipant<S> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn try_reserve(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult {
        let hold_id = transaction_id.to_string();
        let amount = self.amount;
        self.accounts
            .execute_with_retry(ctx, self.account_id, 3, |a| a.reserve(&hold_id, amount))
            .await
            .map_err(step_failure)?;
        Ok(json!({ "hold_id": hold_id }))
    }

    async fn confirm(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult {
        let hold_id = transaction_id.to_string();
        self.accounts
            .execute_with_retry(ctx, self.account_id, 3, |a| a.confirm(&hold_id))
            .await
            .map_err(step_failure)?;
        Ok(Value::Null)
    }

    async fn cancel(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult {
        let hold_id = transaction_id.to_string();
        self.accounts
            .execute_with_retry(ctx, self.account_id, 3, |a| a.release(&hold_id))
            .await
            .map_err(step_failure)?;
        Ok(Value::Null)
    }
}

/// TCC participant that credits the payee on Confirm.
///
/// Try only checks that the account can take a deposit; nothing is reserved,
/// so Cancel has nothing to undo.
pub struct CreditParticipant<S: EventStore> {
    id: String,
    accounts: Arc<Repository<S, Account>>,
    account_id: AggregateId,
    amount: Money,
}

impl<S: EventStore> CreditParticipant<S> {
    pub fn new(accounts: Arc<Repository<S, Account>>, account_id: AggregateId, amount: Money) -> Self {
        Self {
            id: format!("credit:{account_id}"),
            accounts,
            account_id,
            amount,
        }
    }
}

#[async_trait]
impl<S: EventStore> TccParticipant for CreditParticipant<S> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn try_reserve(&self, _ctx: &RequestContext, _transaction_id: SagaId) -> StepResult {
        let account = self.accounts.require(self.account_id).await.map_err(step_failure)?;
        account
            .state()
            .deposit(self.amount, None)
            .map_err(|e| saga::StepFailure::permanent(e.to_string()))?;
        Ok(Value::Null)
    }

    async fn confirm(&self, ctx: &RequestContext, transaction_id: SagaId) -> StepResult {
        let reference = transaction_id.to_string();
        let amount = self.amount;
        self.accounts
            .execute_with_retry(ctx, self.account_id, 3, |a| {
                a.deposit(amount, Some(reference.clone()))
            })
            .await
            .map_err(step_failure)?;
        Ok(Value::Null)
    }

    async fn cancel(&self, _ctx: &RequestContext, _transaction_id: SagaId) -> StepResult {
        Ok(Value::Null)
    }
}

/// Participants for a TCC transfer, payer first.
pub fn participants<S>(
    accounts: Arc<Repository<S, Account>>,
    from: AggregateId,
    to: AggregateId,
    amount: Money,
) -> Vec<Arc<dyn TccParticipant>>
where
    S: EventStore + 'static,
{
    vec![
        Arc::new(DebitParticipant::new(Arc::clone(&accounts), from, amount)),
        Arc::new(CreditParticipant::new(accounts, to, amount)),
    ]
}

/// Rebuilds the participants of a stored TCC transfer from its input.
pub fn participants_for<S>(
    accounts: Arc<Repository<S, Account>>,
    tx: &TccTransaction,
) -> Option<Vec<Arc<dyn TccParticipant>>>
where
    S: EventStore + 'static,
{
    let account = |field: &str| -> Option<AggregateId> {
        serde_json::from_value(tx.input.get(field)?.clone()).ok()
    };
    let amount = tx.input.get("amount")?.as_i64().map(Money::from_cents)?;
    Some(participants(accounts, account("from")?, account("to")?, amount))
}
