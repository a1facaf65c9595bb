//! Outbox dispatcher: delivers pending outbox entries through a [`Publisher`].
//!
//! Delivery is at-least-once. An entry is marked dispatched only after the
//! publisher acknowledged it, so a crash between publish and mark causes a
//! redelivery, never a loss.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{RwLock, watch};

use crate::{AggregateId, OutboxEntry, Result, store::OutboxStore};

/// Failure reported by a publisher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The broker may accept the message later.
    #[error("transient publish failure: {0}")]
    Transient(String),
    /// The message will never be accepted.
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

/// Dispatch port: hands one outbox entry to the messaging layer.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError>;
}

#[async_trait]
impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError> {
        (**self).publish(entry).await
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum entries read per scan.
    pub batch_size: usize,
    /// Delay between scans in [`OutboxDispatcher::run`].
    pub poll_interval: Duration,
    /// Transient failures tolerated before an entry is marked failed.
    pub max_attempts: u32,
    /// A publish that outlasts this counts as a transient failure.
    pub publish_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_attempts: 10,
            publish_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one dispatcher scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry of the same aggregate failed.
    pub deferred: usize,
}

/// Scans pending outbox entries and publishes them in commit order.
pub struct OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    store: S,
    publisher: P,
    config: DispatcherConfig,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    pub fn new(store: S, publisher: P, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Publishes one batch of pending entries.
    ///
    /// Entries of the same aggregate are delivered in commit order: once an
    /// entry fails, later entries of that aggregate wait for the next scan.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_batch(&self) -> Result<DispatchReport> {
        let pending = self.store.pending_outbox(self.config.batch_size).await?;
        let mut report = DispatchReport::default();
        let mut blocked: HashSet<AggregateId> = HashSet::new();

        for entry in pending {
            if blocked.contains(&entry.aggregate_id) {
                report.deferred += 1;
                continue;
            }

            let published =
                tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(&entry))
                    .await
                    .unwrap_or_else(|_| {
                        Err(PublishError::Transient(format!(
                            "publish timed out after {:?}",
                            self.config.publish_timeout
                        )))
                    });
            match published {
                Ok(()) => {
                    self.store
                        .mark_dispatched(&[entry.event_id], Utc::now())
                        .await?;
                    report.dispatched += 1;
                    metrics::counter!("outbox_entries_dispatched_total").increment(1);
                }
                Err(err) => {
                    let permanent = match &err {
                        PublishError::Permanent(_) => true,
                        PublishError::Transient(_) => {
                            entry.attempts + 1 >= self.config.max_attempts
                        }
                    };
                    if permanent {
                        tracing::error!(
                            event_id = %entry.event_id,
                            aggregate_id = %entry.aggregate_id,
                            error = %err,
                            "outbox entry failed permanently"
                        );
                    } else {
                        tracing::warn!(
                            event_id = %entry.event_id,
                            attempt = entry.attempts + 1,
                            error = %err,
                            "outbox publish failed, will retry"
                        );
                    }
                    self.store
                        .record_dispatch_failure(entry.event_id, &err.to_string(), permanent)
                        .await?;
                    blocked.insert(entry.aggregate_id);
                    report.failed += 1;
                    metrics::counter!("outbox_dispatch_failures_total").increment(1);
                }
            }
        }

        Ok(report)
    }

    /// Scans on a fixed interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.dispatch_batch().await {
                        tracing::error!(error = %e, "outbox scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("outbox dispatcher stopping");
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct PublisherState {
    delivered: Vec<OutboxEntry>,
    failures: Vec<PublishError>,
}

/// Publisher that records deliveries in memory.
///
/// Scripted failures are consumed one per publish call before deliveries
/// succeed again.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    state: Arc<RwLock<PublisherState>>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues failures returned by the next publish calls.
    pub async fn fail_next(&self, failures: impl IntoIterator<Item = PublishError>) {
        self.state.write().await.failures.extend(failures);
    }

    /// Every delivery so far, including redeliveries.
    pub async fn delivered(&self) -> Vec<OutboxEntry> {
        self.state.read().await.delivered.clone()
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError> {
        let mut state = self.state.write().await;
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        state.delivered.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventEnvelope, EventStore, InMemoryEventStore, OutboxStatus, Version};

    async fn commit(store: &InMemoryEventStore, aggregate_id: AggregateId, count: i64) {
        let events: Vec<_> = (1..=count)
            .map(|v| {
                EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type("Account")
                    .event_type("FundsDeposited")
                    .version(Version::new(v))
                    .payload_raw(serde_json::json!({"amount": v}))
                    .build()
            })
            .collect();
        let outbox = events
            .iter()
            .map(|e| OutboxEntry::for_event(e).unwrap())
            .collect();
        store
            .commit(aggregate_id, Version::initial(), events, outbox)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatches_pending_entries_in_commit_order() {
        let store = InMemoryEventStore::new();
        let publisher = InMemoryPublisher::new();
        let id = AggregateId::new();
        commit(&store, id, 3).await;

        let dispatcher =
            OutboxDispatcher::new(store.clone(), publisher.clone(), DispatcherConfig::default());
        let report = dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.dispatched, 3);

        let versions: Vec<_> = publisher
            .delivered()
            .await
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![Version::new(1), Version::new(2), Version::new(3)]);
        assert!(store.pending_outbox(10).await.unwrap().is_empty());

        // Nothing left to deliver on the next scan.
        let report = dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn transient_failure_defers_rest_of_aggregate() {
        let store = InMemoryEventStore::new();
        let publisher = InMemoryPublisher::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        commit(&store, a, 2).await;
        commit(&store, b, 1).await;

        publisher
            .fail_next([PublishError::Transient("broker busy".into())])
            .await;
        let dispatcher =
            OutboxDispatcher::new(store.clone(), publisher.clone(), DispatcherConfig::default());

        let report = dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.dispatched, 1);

        let report = dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(report.dispatched, 2);
        let delivered = publisher.delivered().await;
        assert_eq!(delivered.len(), 3);
        assert!(
            store
                .outbox_entries()
                .await
                .iter()
                .all(|e| e.status == OutboxStatus::Dispatched)
        );
    }

    #[tokio::test]
    async fn permanent_failure_marks_entry_failed() {
        let store = InMemoryEventStore::new();
        let publisher = InMemoryPublisher::new();
        let id = AggregateId::new();
        commit(&store, id, 1).await;

        publisher
            .fail_next([PublishError::Permanent("schema rejected".into())])
            .await;
        let dispatcher =
            OutboxDispatcher::new(store.clone(), publisher.clone(), DispatcherConfig::default());
        dispatcher.dispatch_batch().await.unwrap();

        let entries = store.outbox_entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Failed);
        assert!(publisher.delivered().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_transient_failures_mark_entry_failed() {
        let store = InMemoryEventStore::new();
        let publisher = InMemoryPublisher::new();
        let id = AggregateId::new();
        commit(&store, id, 1).await;

        publisher
            .fail_next([
                PublishError::Transient("timeout".into()),
                PublishError::Transient("timeout".into()),
            ])
            .await;
        let config = DispatcherConfig {
            max_attempts: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), publisher.clone(), config);
        dispatcher.dispatch_batch().await.unwrap();
        assert_eq!(store.outbox_entries().await[0].status, OutboxStatus::Pending);

        dispatcher.dispatch_batch().await.unwrap();
        let entry = &store.outbox_entries().await[0];
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.attempts, 2);
    }

    struct StalledPublisher;

    #[async_trait]
    impl Publisher for StalledPublisher {
        async fn publish(&self, _entry: &OutboxEntry) -> std::result::Result<(), PublishError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_times_out_as_transient() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        commit(&store, id, 2).await;

        let config = DispatcherConfig {
            publish_timeout: Duration::from_millis(100),
            ..DispatcherConfig::default()
        };
        let dispatcher = OutboxDispatcher::new(store.clone(), StalledPublisher, config);
        let report = dispatcher.dispatch_batch().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        let entries = store.outbox_entries().await;
        assert_eq!(entries[0].status, OutboxStatus::Pending);
        assert_eq!(entries[0].attempts, 1);
        assert!(entries[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn redelivery_after_lost_ack_keeps_single_dispatched_mark() {
        let store = InMemoryEventStore::new();
        let publisher = InMemoryPublisher::new();
        let id = AggregateId::new();
        commit(&store, id, 1).await;
        let entry = store.pending_outbox(1).await.unwrap().remove(0);

        // Delivered once but the process died before marking it.
        publisher.publish(&entry).await.unwrap();

        let dispatcher =
            OutboxDispatcher::new(store.clone(), publisher.clone(), DispatcherConfig::default());
        dispatcher.dispatch_batch().await.unwrap();

        let delivered = publisher.delivered().await;
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].message_id, delivered[1].message_id);

        let stored = store.outbox_entry(entry.event_id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Dispatched);
        let first_mark = stored.dispatched_at;

        store
            .mark_dispatched(&[entry.event_id], Utc::now())
            .await
            .unwrap();
        let stored = store.outbox_entry(entry.event_id).await.unwrap().unwrap();
        assert_eq!(stored.dispatched_at, first_mark);
    }
}
