//! Core aggregate and domain event traits.

use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded in an aggregate's event log, named in the past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Stable name stored with the event; keys upcaster lookup.
    fn event_type(&self) -> &'static str;

    /// Current schema version of the given event type.
    ///
    /// New events are written with this version; older stored events are
    /// upcast to it before being applied.
    fn schema_version(_event_type: &str) -> u32 {
        1
    }
}

/// An aggregate is the state behind an [`AggregateRoot`](crate::AggregateRoot).
/// Identity, version and uncommitted events live on the root; the aggregate
/// only decides which events a business operation raises and folds events
/// into its state.
pub trait Aggregate: Default + Send + Sync + Sized {
    type Event: DomainEvent;

    /// The rule violations this aggregate's operations can report.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Name stored as `aggregate_type` on every envelope.
    fn aggregate_type() -> &'static str;

    /// Folds one event into the state.
    ///
    /// Replay must reproduce live state exactly, so this cannot fail, read
    /// clocks or touch anything outside `self`.
    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
