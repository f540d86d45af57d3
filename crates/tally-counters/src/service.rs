//! Counter service facade
//!
//! [`CounterService`] wires the cache, the durable store and the notifier into
//! the counter store, the pipeline, the sagas and reconciliation, and exposes
//! the caller API. [`CounterService::start`] spawns the background tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tally_common::{Config, CounterType, Error, MessageId, Result, UserId, unix_seconds};
use tally_store::DurableStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::CacheBackend;
use crate::flows::{MessageSagas, Notifier};
use crate::metrics::CounterMetrics;
use crate::pipeline::{BatchingPipeline, PipelineWorker};
use crate::reconcile::{ConsistencyChecker, Reconciler, reconciliation_loop};
use crate::saga::{SagaOrchestrator, SagaStep};
use crate::store::CounterStore;

/// Every counter of a user at a point in time
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CounterStats {
    pub user_id: UserId,
    pub counters: BTreeMap<CounterType, i64>,
    /// Unix seconds
    pub timestamp: i64,
}

pub struct CounterService {
    config: Config,
    store: Arc<CounterStore>,
    pipeline: BatchingPipeline,
    pipeline_worker: Mutex<Option<PipelineWorker>>,
    orchestrator: Arc<SagaOrchestrator>,
    sagas: MessageSagas,
    reconciler: Arc<Reconciler>,
    checker: Arc<ConsistencyChecker>,
    metrics: Arc<CounterMetrics>,
}

impl CounterService {
    /// Build the service and load the cache scripts.
    ///
    /// Fails with [`Error::Configuration`] when `config` does not validate.
    pub async fn new(
        config: Config,
        cache: Arc<dyn CacheBackend>,
        durable: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CounterMetrics::new());
        let store = Arc::new(CounterStore::new(cache, &config.cache, Arc::clone(&metrics)));
        store.prepare().await;

        let (pipeline, worker) =
            BatchingPipeline::new(Arc::clone(&store), &config.pipeline, Arc::clone(&metrics));
        let orchestrator = Arc::new(SagaOrchestrator::new(Arc::clone(&metrics)));
        let sagas = MessageSagas::new(
            Arc::clone(&store),
            Arc::clone(&durable),
            notifier,
            Arc::clone(&orchestrator),
            config.saga.read_undo_window(),
        );
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            durable,
            Arc::clone(&metrics),
        ));
        let checker = Arc::new(ConsistencyChecker::new(
            Arc::clone(&reconciler),
            config.consistency.clone(),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            store,
            pipeline,
            pipeline_worker: Mutex::new(Some(worker)),
            orchestrator,
            sagas,
            reconciler,
            checker,
            metrics,
        })
    }

    /// Spawn the pipeline worker, the full reconciliation worker and the
    /// consistency checker. Can only be called once.
    pub fn start(&self) -> Result<BackgroundTasks> {
        let worker = self
            .pipeline_worker
            .lock()
            .take()
            .ok_or_else(|| Error::internal("background tasks already started"))?;

        let (shutdown, rx) = watch::channel(false);
        let mut handles = vec![("pipeline", tokio::spawn(worker.run(rx.clone())))];

        if self.config.reconciliation.enabled {
            handles.push((
                "reconciliation",
                tokio::spawn(reconciliation_loop(
                    Arc::clone(&self.reconciler),
                    self.config.reconciliation.clone(),
                    rx.clone(),
                )),
            ));
        }
        if self.config.consistency.enabled {
            handles.push((
                "consistency",
                tokio::spawn(Arc::clone(&self.checker).run(rx)),
            ));
        }

        info!("Started {} background tasks", handles.len());
        Ok(BackgroundTasks { shutdown, handles })
    }

    /// Current count; 0 when the counter is absent or the cache fails
    pub async fn get_counter(&self, user: UserId, counter_type: CounterType) -> Result<i64> {
        Ok(self.store.get(user, counter_type).await)
    }

    pub async fn get_all_counters(&self, user: UserId) -> Result<BTreeMap<CounterType, i64>> {
        Ok(self.store.get_all_for_user(user).await)
    }

    /// Apply a delta now
    pub async fn increment_counter_sync(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> Result<()> {
        self.store.increment(user, counter_type, delta).await?;
        Ok(())
    }

    /// Apply a delta through the batching pipeline
    pub async fn increment_counter_async(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> Result<()> {
        self.pipeline.enqueue(user, counter_type, delta).await?;
        Ok(())
    }

    pub async fn reset_counter(&self, user: UserId, counter_type: CounterType) -> Result<()> {
        self.store.reset(user, counter_type).await?;
        Ok(())
    }

    /// Recompute a counter from the durable store
    pub async fn reconcile_counter(&self, user: UserId, counter_type: CounterType) -> Result<()> {
        self.reconciler.reconcile(user, counter_type).await?;
        Ok(())
    }

    pub async fn run_saga(&self, name: &str, steps: Vec<SagaStep>) -> Result<()> {
        self.orchestrator.run_steps(name, steps).await
    }

    pub async fn handle_new_message(
        &self,
        from: UserId,
        to: UserId,
        text: &str,
    ) -> Result<MessageId> {
        self.sagas.new_message(from, to, text).await
    }

    /// Returns how many messages were marked as read
    pub async fn handle_mark_as_read(&self, user: UserId, partner: UserId) -> Result<i64> {
        self.sagas.mark_as_read(user, partner).await
    }

    pub async fn counter_stats(&self, user: UserId) -> Result<CounterStats> {
        Ok(CounterStats {
            user_id: user,
            counters: self.store.get_all_for_user(user).await,
            timestamp: unix_seconds(),
        })
    }

    #[must_use]
    pub const fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    #[must_use]
    pub const fn counter_store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    #[must_use]
    pub const fn pipeline(&self) -> &BatchingPipeline {
        &self.pipeline
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<SagaOrchestrator> {
        &self.orchestrator
    }
}

/// Handles of the spawned background tasks
pub struct BackgroundTasks {
    shutdown: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    /// Signal every task to stop and wait for them; the pipeline drains first
    pub async fn shutdown(self) {
        // Every receiver may already be gone
        let _ = self.shutdown.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!("Background task {} ended abnormally: {}", name, e);
            }
        }
        info!("Background tasks stopped");
    }
}
