//! Account commands exposed to sagas through the [`CommandPort`].
//!
//! Command inputs name the saga context fields they act on, so one saga
//! definition serves every instance:
//!
//! ```json
//! { "account": "from" }
//! ```
//!
//! reads the account id from `context.from`. The amount comes from
//! `input.amount` or `context.amount` (in cents), and the hold id from
//! `input.hold_id` or, by default, the saga id.

use async_trait::async_trait;
use common::{AggregateId, RequestContext};
use domain::{Account, AccountEvent, CommandResult, DomainError, Money, Repository};
use event_store::EventStore;
use saga::{CommandPort, CommandRef, StepFailure, StepResult};
use serde_json::{Value, json};

pub const RESERVE: &str = "account.reserve";
pub const CONFIRM: &str = "account.confirm";
pub const RELEASE: &str = "account.release";
pub const DEPOSIT: &str = "account.deposit";
pub const WITHDRAW: &str = "account.withdraw";

/// Attempts per command when the account was written concurrently.
const CONFLICT_ATTEMPTS: u32 = 3;

/// Runs account commands against the event-sourced [`Account`] aggregate.
pub struct AccountCommandPort<S: EventStore> {
    accounts: Repository<S, Account>,
}

impl<S: EventStore> AccountCommandPort<S> {
    pub fn new(accounts: Repository<S, Account>) -> Self {
        Self { accounts }
    }

    pub fn accounts(&self) -> &Repository<S, Account> {
        &self.accounts
    }

    async fn run<F>(&self, ctx: &RequestContext, account_id: AggregateId, operation: F) -> StepResult
    where
        F: Fn(&Account) -> Result<Vec<AccountEvent>, domain::AccountError> + Send + Sync,
    {
        let result: CommandResult<Account> = self
            .accounts
            .execute_with_retry(ctx, account_id, CONFLICT_ATTEMPTS, operation)
            .await
            .map_err(step_failure)?;

        Ok(json!({
            "account_id": account_id,
            "version": result.new_version,
            "events": result.events.len(),
        }))
    }
}

#[async_trait]
impl<S: EventStore> CommandPort for AccountCommandPort<S> {
    #[tracing::instrument(skip(self, ctx, command, saga_context), fields(command = %command.name, saga_id = ?ctx.saga_id))]
    async fn execute(&self, ctx: &RequestContext, command: &CommandRef, saga_context: &Value) -> StepResult {
        let args = Args::new(&command.input, saga_context);
        let account_id = args.account_id()?;

        let output = match command.name.as_str() {
            RESERVE => {
                let hold_id = args.hold_id(ctx)?;
                let amount = args.amount()?;
                let mut output = self.run(ctx, account_id, |a| a.reserve(&hold_id, amount)).await?;
                output["hold_id"] = json!(hold_id);
                output
            }
            CONFIRM => {
                let hold_id = args.hold_id(ctx)?;
                self.run(ctx, account_id, |a| a.confirm(&hold_id)).await?
            }
            RELEASE => {
                let hold_id = args.hold_id(ctx)?;
                self.run(ctx, account_id, |a| a.release(&hold_id)).await?
            }
            DEPOSIT => {
                let amount = args.amount()?;
                let reference = ctx.saga_id.map(|id| id.to_string());
                self.run(ctx, account_id, |a| a.deposit(amount, reference.clone()))
                    .await?
            }
            WITHDRAW => {
                let amount = args.amount()?;
                self.run(ctx, account_id, |a| a.withdraw(amount)).await?
            }
            other => {
                return Err(StepFailure::permanent(format!("unknown command {other}")));
            }
        };

        tracing::debug!(%account_id, "account command applied");
        Ok(output)
    }
}

/// Maps persistence errors onto retry semantics.
pub fn step_failure(error: DomainError) -> StepFailure {
    match &error {
        // includes conflicts that outlasted the local retries
        DomainError::EventStore(_) => StepFailure::transient(error.to_string()),
        _ => StepFailure::permanent(error.to_string()),
    }
}

struct Args<'a> {
    input: &'a Value,
    context: &'a Value,
}

impl<'a> Args<'a> {
    fn new(input: &'a Value, context: &'a Value) -> Self {
        Self { input, context }
    }

    fn account_id(&self) -> Result<AggregateId, StepFailure> {
        let field = self
            .input
            .get("account")
            .and_then(Value::as_str)
            .ok_or_else(|| StepFailure::permanent("command input names no account field"))?;
        let value = self
            .context
            .get(field)
            .ok_or_else(|| StepFailure::permanent(format!("saga context has no {field}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| StepFailure::permanent(format!("{field} is not an account id: {e}")))
    }

    fn amount(&self) -> Result<Money, StepFailure> {
        let value = self
            .input
            .get("amount")
            .or_else(|| self.context.get("amount"))
            .ok_or_else(|| StepFailure::permanent("no amount given"))?;
        value
            .as_i64()
            .map(Money::from_cents)
            .ok_or_else(|| StepFailure::permanent(format!("amount {value} is not whole cents")))
    }

    fn hold_id(&self, ctx: &RequestContext) -> Result<String, StepFailure> {
        if let Some(hold_id) = self.input.get("hold_id").and_then(Value::as_str) {
            return Ok(hold_id.to_string());
        }
        ctx.saga_id
            .map(|id| id.to_string())
            .ok_or_else(|| StepFailure::permanent("no hold id and no saga to derive one from"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use domain::account_upcasters;
    use event_store::InMemoryEventStore;

    async fn port_with_account(cents: i64) -> (AccountCommandPort<InMemoryEventStore>, AggregateId) {
        let repo: Repository<InMemoryEventStore, Account> =
            Repository::new(InMemoryEventStore::new()).with_upcasters(account_upcasters());
        let ctx = RequestContext::new();
        let id = AggregateId::new();
        repo.execute(&ctx, id, |a| a.open("alice")).await.unwrap();
        repo.execute(&ctx, id, |a| a.deposit(Money::from_cents(cents), None))
            .await
            .unwrap();
        (AccountCommandPort::new(repo), id)
    }

    #[tokio::test]
    async fn reserve_uses_saga_id_as_hold() {
        let (port, id) = port_with_account(500).await;
        let saga_id = SagaId::new();
        let ctx = RequestContext::new().saga(saga_id);
        let command = CommandRef::new(RESERVE, json!({"account": "from"}));
        let context = json!({"from": id, "amount": 200});

        let output = port.execute(&ctx, &command, &context).await.unwrap();
        assert_eq!(output["hold_id"], json!(saga_id.to_string()));

        // redelivery is absorbed
        port.execute(&ctx, &command, &context).await.unwrap();
        let account = port.accounts().load(id).await.unwrap();
        assert_eq!(account.state().available(), Money::from_cents(300));
    }

    #[tokio::test]
    async fn rule_violations_are_permanent() {
        let (port, id) = port_with_account(100).await;
        let ctx = RequestContext::new().saga(SagaId::new());
        let command = CommandRef::new(RESERVE, json!({"account": "from"}));

        let err = port
            .execute(&ctx, &command, &json!({"from": id, "amount": 1000}))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Insufficient funds"));
    }

    #[tokio::test]
    async fn malformed_input_is_permanent() {
        let (port, _) = port_with_account(100).await;
        let ctx = RequestContext::new();

        let missing = port
            .execute(&ctx, &CommandRef::new(DEPOSIT, json!({})), &json!({}))
            .await
            .unwrap_err();
        assert!(!missing.is_transient());

        let unknown = port
            .execute(
                &ctx,
                &CommandRef::new("account.teleport", json!({"account": "to"})),
                &json!({"to": AggregateId::new()}),
            )
            .await
            .unwrap_err();
        assert!(unknown.to_string().contains("unknown command"));
    }

    #[tokio::test]
    async fn unopened_account_rejects_deposit() {
        let (port, _) = port_with_account(100).await;
        let ctx = RequestContext::new();
        let err = port
            .execute(
                &ctx,
                &CommandRef::new(DEPOSIT, json!({"account": "to", "amount": 5})),
                &json!({"to": AggregateId::new()}),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
