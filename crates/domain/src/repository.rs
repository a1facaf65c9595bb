//! Loading and persisting aggregate roots.

use std::marker::PhantomData;

use common::{AggregateId, RequestContext};
use event_store::{EventEnvelope, EventStore, EventStoreExt, OutboxEntry, Snapshot, Version};
use serde::{Serialize, de::DeserializeOwned};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::{DomainError, Result};
use crate::root::{AggregateRoot, PendingEvent};
use crate::upcast::Upcasters;

/// When to capture a snapshot after a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotPolicy {
    /// Snapshot whenever a commit crosses a multiple of this many events.
    pub interval: Option<u64>,
}

impl SnapshotPolicy {
    pub fn every(events: u64) -> Self {
        Self {
            interval: (events > 0).then_some(events),
        }
    }

    pub fn never() -> Self {
        Self { interval: None }
    }

    /// True when a commit moving the aggregate from `from` to `to` crosses
    /// an interval boundary.
    pub fn should_snapshot(&self, from: Version, to: Version) -> bool {
        match self.interval {
            Some(n) => {
                let from = from.as_i64().max(0) as u64;
                let to = to.as_i64().max(0) as u64;
                to / n > from / n
            }
            None => false,
        }
    }
}

/// Result of executing an operation through the repository.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The root after the new events were committed.
    pub aggregate: AggregateRoot<A>,

    /// The events that were raised and persisted.
    pub events: Vec<A::Event>,

    /// The version of the aggregate after the operation.
    pub new_version: Version,
}

/// Loads aggregate roots from an [`EventStore`] and persists their pending
/// events together with one outbox entry per event.
///
/// Persistence relies only on the optimistic version check; writers that
/// lose a race get a concurrency conflict and must reload.
pub struct Repository<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    snapshots: SnapshotPolicy,
    upcasters: Upcasters,
    _phantom: PhantomData<A>,
}

impl<S, A> Repository<S, A>
where
    S: EventStore,
    A: Aggregate + Serialize + DeserializeOwned,
{
    /// Creates a repository without snapshots or upcasters.
    pub fn new(store: S) -> Self {
        Self {
            store,
            snapshots: SnapshotPolicy::never(),
            upcasters: Upcasters::new(),
            _phantom: PhantomData,
        }
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshots = policy;
        self
    }

    pub fn with_upcasters(mut self, upcasters: Upcasters) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Returns a reference to the underlying event store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate from its latest snapshot and the events after it.
    ///
    /// An aggregate without events comes back as a fresh root at version 0.
    #[tracing::instrument(skip(self), fields(aggregate_type = A::aggregate_type()))]
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<AggregateRoot<A>> {
        let (snapshot, events) = self.store.load_aggregate(aggregate_id).await?;
        AggregateRoot::reconstitute(aggregate_id, snapshot, events, &self.upcasters)
    }

    /// Loads an aggregate, returning None if it has no events.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRoot<A>>> {
        let root = self.load(aggregate_id).await?;
        Ok((!root.is_new()).then_some(root))
    }

    /// Commits the root's pending events and their outbox entries in one
    /// atomic unit, expecting the stored version to equal the root's
    /// committed version.
    ///
    /// On success the pending buffer is cleared and a snapshot may be taken.
    /// On failure nothing is written and the pending events stay on the root.
    #[tracing::instrument(
        skip(self, ctx, root),
        fields(
            aggregate_id = %root.id(),
            aggregate_type = A::aggregate_type(),
            correlation_id = %ctx.correlation_id,
        )
    )]
    pub async fn persist(&self, ctx: &RequestContext, root: &mut AggregateRoot<A>) -> Result<Version> {
        let expected = root.committed_version();
        if !root.has_pending_events() {
            return Ok(expected);
        }

        let events = self.envelopes(ctx, root.id(), root.pending_events())?;
        let outbox = events
            .iter()
            .map(OutboxEntry::for_event)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let new_version = match self.store.commit(root.id(), expected, events, outbox).await {
            Ok(version) => version,
            Err(e) => {
                if e.is_concurrency_conflict() {
                    tracing::warn!(error = %e, "stale aggregate version");
                }
                return Err(e.into());
            }
        };
        root.take_pending();

        if self.snapshots.should_snapshot(expected, new_version) {
            self.snapshot(root).await;
        }

        tracing::debug!(version = %new_version, "aggregate persisted");
        Ok(new_version)
    }

    /// Loads the aggregate, runs `operation` against it and persists the
    /// resulting events.
    pub async fn execute<F>(
        &self,
        ctx: &RequestContext,
        aggregate_id: AggregateId,
        operation: F,
    ) -> Result<CommandResult<A>>
    where
        F: FnOnce(&A) -> std::result::Result<Vec<A::Event>, A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let events = aggregate.execute(operation)?;
        let new_version = self.persist(ctx, &mut aggregate).await?;

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    /// Like [`execute`](Self::execute), but reloads and reruns the operation
    /// after a concurrency conflict, up to `max_attempts` times in total.
    pub async fn execute_with_retry<F>(
        &self,
        ctx: &RequestContext,
        aggregate_id: AggregateId,
        max_attempts: u32,
        operation: F,
    ) -> Result<CommandResult<A>>
    where
        F: Fn(&A) -> std::result::Result<Vec<A::Event>, A::Error>,
    {
        let mut attempt = 1;
        loop {
            match self.execute(ctx, aggregate_id, &operation).await {
                Err(e) if e.is_concurrency_conflict() && attempt < max_attempts => {
                    tracing::warn!(%aggregate_id, attempt, "retrying after concurrency conflict");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Loads an existing aggregate or fails with `AggregateNotFound`.
    pub async fn require(&self, aggregate_id: AggregateId) -> Result<AggregateRoot<A>> {
        self.load_existing(aggregate_id)
            .await?
            .ok_or(DomainError::AggregateNotFound {
                aggregate_type: A::aggregate_type(),
                aggregate_id,
            })
    }

    fn envelopes(
        &self,
        ctx: &RequestContext,
        aggregate_id: AggregateId,
        pending: &[PendingEvent<A::Event>],
    ) -> Result<Vec<EventEnvelope>> {
        pending
            .iter()
            .map(|p| {
                let event_type = p.event.event_type();
                Ok(EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type(A::aggregate_type())
                    .event_type(event_type)
                    .schema_version(A::Event::schema_version(event_type))
                    .version(p.version)
                    .context(ctx)
                    .payload(&p.event)?
                    .build())
            })
            .collect()
    }

    // Snapshots only shorten replay, so a failed save is not an error.
    async fn snapshot(&self, root: &AggregateRoot<A>) {
        let snapshot = match Snapshot::capture(
            root.id(),
            A::aggregate_type(),
            root.version(),
            root.state(),
        ) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize snapshot");
                return;
            }
        };

        match self.store.save_snapshot(snapshot).await {
            Ok(()) => {
                metrics::counter!("snapshots_saved_total").increment(1);
                tracing::debug!(version = %root.version(), "snapshot saved");
            }
            Err(e) => tracing::warn!(error = %e, "failed to save snapshot"),
        }
    }
}
