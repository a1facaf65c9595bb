//! Saga worker: wires the stores, the saga manager and the outbox dispatcher.
//!
//! Account events raised by saga steps carry the saga id in their metadata.
//! The outbox dispatcher hands them to a [`SagaTriggerPublisher`], which wakes
//! the saga manager for the next step; the manager's poll loop covers
//! triggers that were lost or are waiting on a retry.
//!
//! TCC transfers left unfinished by an earlier process are resumed from
//! their stored records when the worker starts.

pub mod commands;
pub mod config;
pub mod telemetry;
pub mod transfer;

use std::sync::Arc;
use std::time::Duration;

use domain::{Account, Repository, SnapshotPolicy, account_upcasters};
use event_store::{DispatcherConfig, EventStore, OutboxDispatcher, OutboxStore, SagaStore};
use saga::{
    RetryPolicy, SagaManager, SagaManagerConfig, SagaTriggerPublisher, TccConfig, TccCoordinator,
};
use tokio::sync::watch;

use crate::commands::AccountCommandPort;
use crate::config::Config;

pub type Manager<S> = SagaManager<S, AccountCommandPort<S>>;

/// Account repository with the configured snapshot interval.
pub fn accounts<S: EventStore>(store: S, config: &Config) -> Repository<S, Account> {
    Repository::new(store)
        .with_snapshot_policy(SnapshotPolicy::every(config.snapshot_interval))
        .with_upcasters(account_upcasters())
}

/// Saga manager running account commands, with the transfer saga registered.
pub fn manager<S>(store: S, config: &Config) -> saga::Result<Manager<S>>
where
    S: EventStore + SagaStore + Clone,
{
    let port = AccountCommandPort::new(accounts(store.clone(), config));
    SagaManager::new(
        store,
        port,
        SagaManagerConfig {
            poll_interval: config.saga_poll_interval,
            batch_size: config.outbox_batch_size,
        },
    )
    .with_definition(transfer::definition(RetryPolicy::default()))
}

/// Outbox dispatcher that triggers sagas from their step events.
pub fn dispatcher<S>(
    store: S,
    manager: Arc<Manager<S>>,
    config: &Config,
) -> OutboxDispatcher<S, SagaTriggerPublisher<S, AccountCommandPort<S>>>
where
    S: EventStore + OutboxStore + SagaStore,
{
    OutboxDispatcher::new(
        store,
        SagaTriggerPublisher::new(manager),
        DispatcherConfig {
            batch_size: config.outbox_batch_size,
            poll_interval: config.outbox_poll_interval,
            ..DispatcherConfig::default()
        },
    )
}

/// TCC coordinator storing its transactions next to the sagas.
pub fn tcc<S: SagaStore>(store: S) -> TccCoordinator<S> {
    TccCoordinator::new(store, TccConfig::default())
}

/// Finishes TCC transfers that an earlier process left unfinished.
///
/// Returns how many were finished.
pub async fn recover_transfers<S>(store: S, config: &Config) -> saga::Result<usize>
where
    S: EventStore + SagaStore + Clone + 'static,
{
    let accounts = Arc::new(accounts(store.clone(), config));
    let finished = tcc(store)
        .recover(Duration::ZERO, |tx| {
            transfer::participants_for(Arc::clone(&accounts), tx)
        })
        .await?;
    Ok(finished.len())
}

/// Runs the saga manager and the outbox dispatcher until `shutdown` flips to
/// true, then waits for both to stop.
pub async fn run<S>(store: S, config: &Config, shutdown: watch::Receiver<bool>) -> saga::Result<()>
where
    S: EventStore + OutboxStore + SagaStore + Clone + 'static,
{
    let manager = Arc::new(manager(store.clone(), config)?);
    let dispatcher = dispatcher(store.clone(), Arc::clone(&manager), config);

    let recovery = tokio::spawn({
        let config = config.clone();
        async move {
            match recover_transfers(store, &config).await {
                Ok(0) => {}
                Ok(finished) => tracing::info!(finished, "unfinished tcc transfers recovered"),
                Err(e) => tracing::error!(error = %e, "tcc recovery failed"),
            }
        }
    });

    let sagas = tokio::spawn(Arc::clone(&manager).run(shutdown.clone()));
    let outbox = tokio::spawn(async move { dispatcher.run(shutdown).await });
    tracing::info!("worker running");

    if let Err(e) = outbox.await {
        tracing::error!(error = %e, "outbox dispatcher task failed");
    }
    match sagas.await {
        Ok(result) => result?,
        Err(e) => tracing::error!(error = %e, "saga manager task failed"),
    }
    // an interrupted recovery resumes on the next start
    recovery.abort();
    tracing::info!("worker stopped");
    Ok(())
}
