//! Domain layer for the event-sourcing system.
//!
//! This crate provides:
//! - [`Aggregate`] and [`DomainEvent`] traits for event-sourced state
//! - [`AggregateRoot`], which raises events, buffers them until commit and
//!   rebuilds state from a snapshot plus the event tail
//! - upcasting of old event schemas on replay
//! - [`Repository`], which persists pending events together with their outbox
//!   entries under optimistic concurrency
//! - embeddable capabilities (timestamps, archival)
//! - a sample [`Account`] aggregate

pub mod account;
pub mod aggregate;
pub mod capability;
pub mod error;
pub mod repository;
pub mod root;
pub mod upcast;

pub use account::{
    Account, AccountError, AccountEvent, AccountStatus, Money, account_upcasters,
};
pub use aggregate::{Aggregate, DomainEvent};
pub use capability::{Archivable, Archival, ArchivalError, HasTimestamps, Timestamps};
pub use error::{DomainError, Result};
pub use repository::{CommandResult, Repository, SnapshotPolicy};
pub use root::{AggregateRoot, PendingEvent};
pub use upcast::{UpcastError, Upcaster, Upcasters};
