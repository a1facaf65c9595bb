//! Account aggregate: a balance with two-phase holds.
//!
//! Used as the participant behind transfer sagas and TCC transactions.

mod aggregate;
mod events;
mod money;

pub use aggregate::Account;
pub use events::{
    AccountArchivedData, AccountClosedData, AccountEvent, AccountOpenedData, FundsDepositedData,
    FundsDepositedV1ToV2, FundsReservedData, FundsWithdrawnData, ReservationSettledData,
    account_upcasters,
};
pub use money::Money;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::ArchivalError;

/// Lifecycle of an account.
///
/// ```text
/// Unopened ──► Open ──► Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccountStatus {
    #[default]
    Unopened,
    Open,
    Closed,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Unopened => write!(f, "Unopened"),
            AccountStatus::Open => write!(f, "Open"),
            AccountStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// Errors that can occur during account operations.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account already opened")]
    AlreadyOpened,

    #[error("Owner is required")]
    OwnerRequired,

    #[error("Invalid status: cannot {action} a {status} account")]
    InvalidStatus {
        status: AccountStatus,
        action: &'static str,
    },

    #[error("Invalid amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: Money },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Money, available: Money },

    #[error("Hold not found: {hold_id}")]
    HoldNotFound { hold_id: String },

    #[error("Hold {hold_id} already exists with a different amount")]
    HoldConflict { hold_id: String },

    #[error("Hold {hold_id} was already settled")]
    HoldSettled { hold_id: String },

    #[error("Account has {count} open holds")]
    OpenHolds { count: usize },

    #[error("Account balance is {balance}, must be zero to close")]
    NonZeroBalance { balance: Money },

    #[error(transparent)]
    Archival(#[from] ArchivalError),
}
