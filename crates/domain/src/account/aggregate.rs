//! Account aggregate implementation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::capability::{Archivable, Archival, HasTimestamps, Timestamps};

use super::{AccountError, AccountEvent, AccountStatus, Money};

/// A balance that can be debited directly or through two-phase holds.
///
/// Holds are keyed by a caller-chosen id so that reserve, confirm and
/// release can be retried safely: repeating a settled operation raises no
/// new events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    owner: Option<String>,

    status: AccountStatus,

    balance: Money,

    /// Open holds, keyed by hold id.
    holds: BTreeMap<String, Money>,

    /// Hold ids that were confirmed or released.
    settled: BTreeSet<String>,

    timestamps: Timestamps,

    archival: Archival,
}

impl Aggregate for Account {
    type Event = AccountEvent;
    type Error = AccountError;

    fn aggregate_type() -> &'static str {
        "Account"
    }

    fn apply(&mut self, event: Self::Event) {
        match event {
            AccountEvent::AccountOpened(data) => {
                self.owner = Some(data.owner);
                self.status = AccountStatus::Open;
                self.timestamps.touch(data.opened_at);
            }
            AccountEvent::FundsDeposited(data) => {
                self.balance += data.amount;
                self.timestamps.touch(data.at);
            }
            AccountEvent::FundsWithdrawn(data) => {
                self.balance -= data.amount;
                self.timestamps.touch(data.at);
            }
            AccountEvent::FundsReserved(data) => {
                self.holds.insert(data.hold_id, data.amount);
                self.timestamps.touch(data.at);
            }
            AccountEvent::ReservationReleased(data) => {
                self.holds.remove(&data.hold_id);
                self.settled.insert(data.hold_id);
                self.timestamps.touch(data.at);
            }
            AccountEvent::ReservationConfirmed(data) => {
                self.holds.remove(&data.hold_id);
                self.settled.insert(data.hold_id);
                self.balance -= data.amount;
                self.timestamps.touch(data.at);
            }
            AccountEvent::AccountClosed(data) => {
                self.status = AccountStatus::Closed;
                self.timestamps.touch(data.at);
            }
            AccountEvent::AccountArchived(data) => {
                // Already-archived streams are rejected before the event is raised.
                let _ = self.archival.archive(data.at, data.by);
                self.timestamps.touch(data.at);
            }
        }
    }
}

impl HasTimestamps for Account {
    fn timestamps(&self) -> &Timestamps {
        &self.timestamps
    }
}

impl Archivable for Account {
    fn archival(&self) -> &Archival {
        &self.archival
    }
}

// Query methods
impl Account {
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    /// Booked balance, including funds under hold.
    pub fn balance(&self) -> Money {
        self.balance
    }

    /// Balance minus open holds.
    pub fn available(&self) -> Money {
        self.balance - self.held()
    }

    /// Sum of open holds.
    pub fn held(&self) -> Money {
        self.holds.values().copied().sum()
    }

    pub fn hold(&self, hold_id: &str) -> Option<Money> {
        self.holds.get(hold_id).copied()
    }

    pub fn open_holds(&self) -> usize {
        self.holds.len()
    }
}

// Command methods (return events)
impl Account {
    pub fn open(&self, owner: &str) -> Result<Vec<AccountEvent>, AccountError> {
        if self.status != AccountStatus::Unopened {
            return Err(AccountError::AlreadyOpened);
        }
        if owner.trim().is_empty() {
            return Err(AccountError::OwnerRequired);
        }
        Ok(vec![AccountEvent::account_opened(owner)])
    }

    pub fn deposit(
        &self,
        amount: Money,
        reference: Option<String>,
    ) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open("deposit")?;
        ensure_positive(amount)?;
        Ok(vec![AccountEvent::funds_deposited(amount, reference)])
    }

    pub fn withdraw(&self, amount: Money) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open("withdraw")?;
        ensure_positive(amount)?;
        self.ensure_available(amount)?;
        Ok(vec![AccountEvent::funds_withdrawn(amount)])
    }

    /// Places a hold. Re-reserving an open hold with the same amount is a no-op.
    pub fn reserve(&self, hold_id: &str, amount: Money) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open("reserve")?;
        ensure_positive(amount)?;

        if let Some(existing) = self.hold(hold_id) {
            if existing == amount {
                return Ok(vec![]);
            }
            return Err(AccountError::HoldConflict {
                hold_id: hold_id.to_string(),
            });
        }
        if self.settled.contains(hold_id) {
            return Err(AccountError::HoldSettled {
                hold_id: hold_id.to_string(),
            });
        }

        self.ensure_available(amount)?;
        Ok(vec![AccountEvent::funds_reserved(hold_id, amount)])
    }

    /// Debits a held amount. Confirming a settled hold is a no-op.
    pub fn confirm(&self, hold_id: &str) -> Result<Vec<AccountEvent>, AccountError> {
        match self.hold(hold_id) {
            Some(amount) => Ok(vec![AccountEvent::reservation_confirmed(hold_id, amount)]),
            None if self.settled.contains(hold_id) => Ok(vec![]),
            None => Err(AccountError::HoldNotFound {
                hold_id: hold_id.to_string(),
            }),
        }
    }

    /// Drops a hold. Releasing a settled or unknown hold is a no-op, so a
    /// compensation can run even when the reservation never landed.
    pub fn release(&self, hold_id: &str) -> Result<Vec<AccountEvent>, AccountError> {
        match self.hold(hold_id) {
            Some(amount) => Ok(vec![AccountEvent::reservation_released(hold_id, amount)]),
            None => Ok(vec![]),
        }
    }

    pub fn close(&self) -> Result<Vec<AccountEvent>, AccountError> {
        self.ensure_open("close")?;
        if !self.holds.is_empty() {
            return Err(AccountError::OpenHolds {
                count: self.holds.len(),
            });
        }
        if !self.balance.is_zero() {
            return Err(AccountError::NonZeroBalance {
                balance: self.balance,
            });
        }
        Ok(vec![AccountEvent::account_closed()])
    }

    pub fn archive(&self, by: Option<String>) -> Result<Vec<AccountEvent>, AccountError> {
        if self.status != AccountStatus::Closed {
            return Err(AccountError::InvalidStatus {
                status: self.status,
                action: "archive",
            });
        }
        self.archival.can_archive()?;
        Ok(vec![AccountEvent::account_archived(by)])
    }

    fn ensure_open(&self, action: &'static str) -> Result<(), AccountError> {
        self.archival.ensure_active()?;
        if self.status != AccountStatus::Open {
            return Err(AccountError::InvalidStatus {
                status: self.status,
                action,
            });
        }
        Ok(())
    }

    fn ensure_available(&self, amount: Money) -> Result<(), AccountError> {
        let available = self.available();
        if amount > available {
            return Err(AccountError::InsufficientFunds {
                requested: amount,
                available,
            });
        }
        Ok(())
    }
}

fn ensure_positive(amount: Money) -> Result<(), AccountError> {
    if !amount.is_positive() {
        return Err(AccountError::InvalidAmount { amount });
    }
    Ok(())
}
