//! Aggregate root: identity, version and the buffer of uncommitted events.

use common::AggregateId;
use event_store::{EventEnvelope, Snapshot, Version};
use serde::de::DeserializeOwned;

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::{DomainError, Result};
use crate::upcast::Upcasters;

/// An event raised by a business operation but not yet committed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent<E> {
    /// Sequence number assigned when the event was raised.
    pub version: Version,
    pub event: E,
}

/// Consistency boundary around an aggregate's state.
///
/// `version` always equals the number of events folded into `state`,
/// committed or pending. State is only changed through [`raise`](Self::raise)
/// and [`execute`](Self::execute).
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: AggregateId,
    version: Version,
    state: A,
    pending: Vec<PendingEvent<A::Event>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Creates a fresh root at version 0.
    pub fn new(id: AggregateId) -> Self {
        Self {
            id,
            version: Version::initial(),
            state: A::default(),
            pending: Vec::new(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }

    /// Highest sequence number applied, including pending events.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Version the event log is expected to hold for this aggregate.
    pub fn committed_version(&self) -> Version {
        Version::new(self.version.as_i64() - self.pending.len() as i64)
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn pending_events(&self) -> &[PendingEvent<A::Event>] {
        &self.pending
    }

    pub fn has_pending_events(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True until the first event has been applied.
    pub fn is_new(&self) -> bool {
        self.version == Version::initial()
    }

    /// Assigns the next sequence number, applies the event and buffers it.
    pub fn raise(&mut self, event: A::Event) {
        self.version = self.version.next();
        self.state.apply(event.clone());
        self.pending.push(PendingEvent {
            version: self.version,
            event,
        });
    }

    /// Runs a business operation against the current state and raises the
    /// events it decides on.
    ///
    /// A rejected operation raises nothing.
    pub fn execute<F>(&mut self, operation: F) -> Result<Vec<A::Event>>
    where
        F: FnOnce(&A) -> std::result::Result<Vec<A::Event>, A::Error>,
    {
        let events = operation(&self.state)
            .map_err(|e| DomainError::rejected(A::aggregate_type(), e))?;
        for event in &events {
            self.raise(event.clone());
        }
        Ok(events)
    }

    /// Hands the pending events to the caller, leaving the buffer empty.
    pub fn take_pending(&mut self) -> Vec<PendingEvent<A::Event>> {
        std::mem::take(&mut self.pending)
    }

    /// Rebuilds a root from an optional snapshot and the events after it.
    ///
    /// The snapshot must belong to this aggregate. The first event must be
    /// `snapshot.version + 1` (or 1 without a snapshot) and every following
    /// event must continue without gaps.
    /// Old schema versions are upcast before being applied. Any failure
    /// discards the partially rebuilt state.
    #[tracing::instrument(skip(snapshot, events, upcasters), fields(events = events.len()))]
    pub fn reconstitute(
        id: AggregateId,
        snapshot: Option<Snapshot>,
        events: Vec<EventEnvelope>,
        upcasters: &Upcasters,
    ) -> Result<Self>
    where
        A: DeserializeOwned,
    {
        let mut root = match snapshot {
            Some(snapshot)
                if snapshot.aggregate_id != id || snapshot.aggregate_type != A::aggregate_type() =>
            {
                return Err(DomainError::SnapshotMismatch {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id: id,
                    found_type: snapshot.aggregate_type,
                    found_id: snapshot.aggregate_id,
                });
            }
            Some(snapshot) => Self {
                id,
                version: snapshot.version,
                state: snapshot.restore()?,
                pending: Vec::new(),
            },
            None => Self::new(id),
        };

        for envelope in events {
            let expected = root.version.next();
            if envelope.version != expected || envelope.aggregate_id != id {
                return Err(DomainError::Consistency {
                    aggregate_id: id,
                    expected,
                    found: envelope.version,
                });
            }

            let event = decode::<A::Event>(envelope, upcasters)?;
            root.state.apply(event);
            root.version = expected;
        }

        Ok(root)
    }
}

/// Upcasts a stored payload to the current schema and deserializes it.
fn decode<E: DomainEvent>(envelope: EventEnvelope, upcasters: &Upcasters) -> Result<E> {
    let current = E::schema_version(&envelope.event_type);
    let payload = if envelope.schema_version == current {
        envelope.payload
    } else {
        upcasters.upcast(
            &envelope.event_type,
            envelope.schema_version,
            current,
            envelope.payload,
        )?
    };
    Ok(serde_json::from_value(payload)?)
}
