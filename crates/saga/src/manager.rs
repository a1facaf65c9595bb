//! Saga manager: starts, advances and schedules saga instances.
//!
//! Instances advance one step at a time under a per-instance lock, and every
//! step is saved with optimistic locking before the next one starts. A poll
//! loop picks up instances whose retry is due or whose trigger was lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{RequestContext, SagaId};
use event_store::{SagaStore, Version};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::executor::{Progress, SagaExecutor};
use crate::instance::SagaInstance;
use crate::port::CommandPort;
use crate::state::SagaState;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SagaManagerConfig {
    /// Delay between scans for due instances.
    pub poll_interval: Duration,
    /// Maximum instances picked up per scan.
    pub batch_size: usize,
}

impl Default for SagaManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Owns the registered saga definitions and drives their instances.
pub struct SagaManager<S, P>
where
    S: SagaStore,
    P: CommandPort,
{
    store: S,
    executor: SagaExecutor<P>,
    config: SagaManagerConfig,
    definitions: HashMap<String, Arc<SagaDefinition>>,
    locks: Mutex<HashMap<SagaId, Arc<Mutex<()>>>>,
    triggers: mpsc::UnboundedSender<SagaId>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SagaId>>>,
}

impl<S, P> SagaManager<S, P>
where
    S: SagaStore,
    P: CommandPort,
{
    pub fn new(store: S, port: P, config: SagaManagerConfig) -> Self {
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        Self {
            store,
            executor: SagaExecutor::new(port),
            config,
            definitions: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
            triggers,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    /// Registers a saga type. A later registration of the same type replaces
    /// the earlier one.
    pub fn register(&mut self, definition: SagaDefinition) -> Result<()> {
        definition.validate().map_err(SagaError::InvalidDefinition)?;
        tracing::debug!(saga_type = %definition.saga_type, steps = definition.len(), "saga type registered");
        self.definitions
            .insert(definition.saga_type.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn with_definition(mut self, definition: SagaDefinition) -> Result<Self> {
        self.register(definition)?;
        Ok(self)
    }

    pub fn definition(&self, saga_type: &str) -> Option<&SagaDefinition> {
        self.definitions.get(saga_type).map(Arc::as_ref)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn port(&self) -> &P {
        self.executor.port()
    }

    /// Persists a new instance of `saga_type` and schedules its first step.
    #[tracing::instrument(skip(self, ctx, input), fields(correlation_id = %ctx.correlation_id))]
    pub async fn start(
        &self,
        ctx: &RequestContext,
        saga_type: &str,
        input: serde_json::Value,
    ) -> Result<SagaId> {
        if !self.definitions.contains_key(saga_type) {
            return Err(SagaError::UnknownSagaType(saga_type.to_string()));
        }

        let instance = SagaInstance::new(saga_type, ctx, input);
        self.store
            .save_saga_instance(instance.to_record()?, Version::initial())
            .await?;

        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        tracing::info!(saga_id = %instance.saga_id, "saga started");
        self.trigger(instance.saga_id);
        Ok(instance.saga_id)
    }

    /// Asks the run loop to advance `saga_id`. Without a running loop the
    /// instance is still picked up by the next poll.
    pub fn trigger(&self, saga_id: SagaId) {
        if self.triggers.send(saga_id).is_err() {
            tracing::debug!(%saga_id, "trigger dropped, run loop has stopped");
        }
    }

    /// Advances `saga_id` until it finishes or waits for a retry.
    ///
    /// Each step is taken under the instance lock with a fresh load, so
    /// concurrent callers never run the same step twice and a pending
    /// cancellation is seen before the next step. A stale save aborts with a
    /// concurrency-conflict error and leaves the instance to its other owner.
    #[tracing::instrument(skip(self))]
    pub async fn advance(&self, saga_id: SagaId) -> Result<Progress> {
        let started = Instant::now();
        let lock = self.lock_for(saga_id).await;
        let result = self.advance_locked(saga_id, &lock).await;

        match &result {
            Ok(Progress::Finished(_))
            | Err(SagaError::NotFound(_) | SagaError::UnknownSagaType(_)) => {
                self.release_lock(saga_id).await;
            }
            _ => {}
        }
        metrics::histogram!("saga_advance_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn advance_locked(&self, saga_id: SagaId, lock: &Mutex<()>) -> Result<Progress> {
        loop {
            let _guard = lock.lock().await;

            let mut instance = self.load(saga_id).await?;
            if instance.is_terminal() {
                return Ok(Progress::Finished(instance.state));
            }
            let now = Utc::now();
            match instance.next_retry_at {
                Some(at) if at > now => return Ok(Progress::Waiting(at)),
                _ => {}
            }

            let definition = self
                .definitions
                .get(&instance.saga_type)
                .cloned()
                .ok_or_else(|| SagaError::UnknownSagaType(instance.saga_type.clone()))?;

            let progress = self.executor.step(&definition, &mut instance, now).await;
            self.save(&instance).await?;

            match progress {
                Progress::Advanced => continue,
                Progress::Waiting(at) if at <= Utc::now() => continue,
                other => return Ok(other),
            }
        }
    }

    /// Advances every instance that is due now, one after another.
    ///
    /// Returns how many instances were advanced without error.
    pub async fn poll_once(&self) -> Result<usize> {
        let due = self
            .store
            .due_saga_instances(Utc::now(), self.config.batch_size)
            .await?;
        let mut advanced = 0;
        for record in due.into_iter().filter(|r| self.owns(&r.saga_type)) {
            match self.advance(record.saga_id).await {
                Ok(_) => advanced += 1,
                Err(e) => log_advance_error(record.saga_id, &e),
            }
        }
        Ok(advanced)
    }

    /// Flags `saga_id` for cancellation.
    ///
    /// The flag takes effect before the next action: completed steps are
    /// then compensated and the saga ends `Cancelled` (or `Failed` if a
    /// compensation cannot be applied). Returns false if the saga had already
    /// finished.
    #[tracing::instrument(skip(self))]
    pub async fn request_cancel(&self, saga_id: SagaId) -> Result<bool> {
        let lock = self.lock_for(saga_id).await;
        {
            let guard = lock.lock().await;
            let mut instance = match self.load(saga_id).await {
                Ok(instance) => instance,
                Err(e @ (SagaError::NotFound(_) | SagaError::UnknownSagaType(_))) => {
                    drop(guard);
                    self.release_lock(saga_id).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            if instance.is_terminal() {
                drop(guard);
                self.release_lock(saga_id).await;
                return Ok(false);
            }
            if instance.cancel_requested {
                return Ok(true);
            }

            instance.cancel_requested = true;
            instance.updated_at = Utc::now();
            if instance.state == SagaState::Running {
                instance.next_retry_at = None;
            }
            self.save(&instance).await?;
            tracing::info!(state = %instance.state, "saga cancellation requested");
        }
        self.trigger(saga_id);
        Ok(true)
    }

    pub async fn instance(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        match self.store.load_saga_instance(saga_id).await? {
            Some(record) => Ok(Some(SagaInstance::from_record(&record)?)),
            None => Ok(None),
        }
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaInstance> {
        let record = self
            .store
            .load_saga_instance(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        if !self.owns(&record.saga_type) {
            return Err(SagaError::UnknownSagaType(record.saga_type));
        }
        Ok(SagaInstance::from_record(&record)?)
    }

    async fn save(&self, instance: &SagaInstance) -> Result<Version> {
        let version = self
            .store
            .save_saga_instance(instance.to_record()?, instance.version)
            .await?;
        Ok(version)
    }

    /// Records of unregistered types belong to other coordinators.
    fn owns(&self, saga_type: &str) -> bool {
        self.definitions.contains_key(saga_type)
    }

    async fn lock_for(&self, saga_id: SagaId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(saga_id)
            .or_default()
            .clone()
    }

    async fn release_lock(&self, saga_id: SagaId) {
        self.locks.lock().await.remove(&saga_id);
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl<S, P> SagaManager<S, P>
where
    S: SagaStore + 'static,
    P: CommandPort + 'static,
{
    /// Advances triggered instances and polls for due ones until `shutdown`
    /// flips to true. In-flight advances are awaited before returning.
    ///
    /// Only one run loop per manager is allowed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut triggers = self
            .trigger_rx
            .lock()
            .await
            .take()
            .ok_or(SagaError::AlreadyRunning)?;

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "saga manager started"
        );

        loop {
            tokio::select! {
                Some(saga_id) = triggers.recv() => {
                    self.spawn_advance(&mut tasks, saga_id);
                }
                _ = interval.tick() => {
                    match self.store.due_saga_instances(Utc::now(), self.config.batch_size).await {
                        Ok(due) => {
                            for record in due.into_iter().filter(|r| self.owns(&r.saga_type)) {
                                self.spawn_advance(&mut tasks, record.saga_id);
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "saga poll failed"),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "saga advance task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(in_flight = tasks.len(), "saga manager stopping");
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "saga advance task panicked");
            }
        }
        Ok(())
    }

    fn spawn_advance(self: &Arc<Self>, tasks: &mut JoinSet<()>, saga_id: SagaId) {
        let manager = Arc::clone(self);
        tasks.spawn(async move {
            if let Err(e) = manager.advance(saga_id).await {
                log_advance_error(saga_id, &e);
            }
        });
    }
}

fn log_advance_error(saga_id: SagaId, error: &SagaError) {
    if let SagaError::UnknownSagaType(saga_type) = error {
        tracing::debug!(%saga_id, %saga_type, "not a saga of this manager, trigger ignored");
    } else if error.is_concurrency_conflict() {
        tracing::warn!(%saga_id, error = %error, "saga advanced elsewhere, attempt abandoned");
    } else {
        tracing::error!(%saga_id, error = %error, "saga advance failed");
    }
}
