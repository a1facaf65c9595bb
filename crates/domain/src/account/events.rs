//! Account domain events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::DomainEvent;
use crate::upcast::{Upcaster, Upcasters};

use super::Money;

/// Events that can occur on an account aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    AccountOpened(AccountOpenedData),
    FundsDeposited(FundsDepositedData),
    FundsWithdrawn(FundsWithdrawnData),

    /// Funds were set aside under a hold; the balance is unchanged.
    FundsReserved(FundsReservedData),

    /// A hold was dropped without moving money.
    ReservationReleased(ReservationSettledData),

    /// A hold was turned into a debit.
    ReservationConfirmed(ReservationSettledData),

    AccountClosed(AccountClosedData),
    AccountArchived(AccountArchivedData),
}

impl DomainEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened(_) => "AccountOpened",
            AccountEvent::FundsDeposited(_) => "FundsDeposited",
            AccountEvent::FundsWithdrawn(_) => "FundsWithdrawn",
            AccountEvent::FundsReserved(_) => "FundsReserved",
            AccountEvent::ReservationReleased(_) => "ReservationReleased",
            AccountEvent::ReservationConfirmed(_) => "ReservationConfirmed",
            AccountEvent::AccountClosed(_) => "AccountClosed",
            AccountEvent::AccountArchived(_) => "AccountArchived",
        }
    }

    fn schema_version(event_type: &str) -> u32 {
        match event_type {
            // v2 renamed `amount_cents` to `amount` and added `reference`.
            "FundsDeposited" => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOpenedData {
    pub owner: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsDepositedData {
    pub amount: Money,

    /// External reference of the transfer, if any.
    pub reference: Option<String>,

    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsWithdrawnData {
    pub amount: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsReservedData {
    pub hold_id: String,
    pub amount: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationSettledData {
    pub hold_id: String,
    pub amount: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountClosedData {
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountArchivedData {
    pub by: Option<String>,
    pub at: DateTime<Utc>,
}

// Helper constructors
impl AccountEvent {
    pub fn account_opened(owner: impl Into<String>) -> Self {
        AccountEvent::AccountOpened(AccountOpenedData {
            owner: owner.into(),
            opened_at: Utc::now(),
        })
    }

    pub fn funds_deposited(amount: Money, reference: Option<String>) -> Self {
        AccountEvent::FundsDeposited(FundsDepositedData {
            amount,
            reference,
            at: Utc::now(),
        })
    }

    pub fn funds_withdrawn(amount: Money) -> Self {
        AccountEvent::FundsWithdrawn(FundsWithdrawnData {
            amount,
            at: Utc::now(),
        })
    }

    pub fn funds_reserved(hold_id: impl Into<String>, amount: Money) -> Self {
        AccountEvent::FundsReserved(FundsReservedData {
            hold_id: hold_id.into(),
            amount,
            at: Utc::now(),
        })
    }

    pub fn reservation_released(hold_id: impl Into<String>, amount: Money) -> Self {
        AccountEvent::ReservationReleased(ReservationSettledData {
            hold_id: hold_id.into(),
            amount,
            at: Utc::now(),
        })
    }

    pub fn reservation_confirmed(hold_id: impl Into<String>, amount: Money) -> Self {
        AccountEvent::ReservationConfirmed(ReservationSettledData {
            hold_id: hold_id.into(),
            amount,
            at: Utc::now(),
        })
    }

    pub fn account_closed() -> Self {
        AccountEvent::AccountClosed(AccountClosedData { at: Utc::now() })
    }

    pub fn account_archived(by: Option<String>) -> Self {
        AccountEvent::AccountArchived(AccountArchivedData { by, at: Utc::now() })
    }
}

/// `FundsDeposited` v1 -> v2.
///
/// v1 payload: `{"amount_cents": 100, "at": ...}`.
pub struct FundsDepositedV1ToV2;

impl Upcaster for FundsDepositedV1ToV2 {
    fn event_type(&self) -> &str {
        "FundsDeposited"
    }

    fn from_version(&self) -> u32 {
        1
    }

    fn upcast(&self, mut payload: serde_json::Value) -> Result<serde_json::Value, String> {
        let data = payload
            .get_mut("data")
            .and_then(serde_json::Value::as_object_mut)
            .ok_or("FundsDeposited v1 payload has no data object")?;
        let amount = data
            .remove("amount_cents")
            .ok_or("FundsDeposited v1 payload has no amount_cents")?;
        data.insert("amount".to_string(), amount);
        data.insert("reference".to_string(), serde_json::Value::Null);
        Ok(payload)
    }
}

/// Upcasters for every retired account event schema.
pub fn account_upcasters() -> Upcasters {
    Upcasters::new().with(FundsDepositedV1ToV2)
}
