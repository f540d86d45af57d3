//! Write-batching pipeline
//!
//! Callers that do not need the new value enqueue counter deltas here. A
//! single worker drains the queue and applies up to `batch_size` deltas per
//! batch script call, or whatever is buffered when the flush interval fires.
//! A caller that finds the queue full for longer than the enqueue timeout
//! applies its delta directly instead of waiting.

use std::sync::Arc;
use std::time::Duration;

use tally_common::config::PipelineConfig;
use tally_common::{CounterKey, CounterType, Result, UserId};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics::CounterMetrics;
use crate::store::CounterStore;

/// How a queued update ended up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    Applied,
    Failed,
}

/// Where `enqueue` left the update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Buffered; the worker applies it with the next batch
    Queued,
    /// The queue was full or closed and the delta was applied synchronously
    AppliedDirectly,
}

/// A delta waiting to be applied
#[derive(Debug)]
pub struct CounterUpdate {
    pub key: CounterKey,
    pub delta: i64,
    done: Option<oneshot::Sender<UpdateStatus>>,
}

impl CounterUpdate {
    #[must_use]
    pub const fn new(key: CounterKey, delta: i64) -> Self {
        Self {
            key,
            delta,
            done: None,
        }
    }

    fn complete(self, status: UpdateStatus) {
        if let Some(done) = self.done {
            // The caller may have stopped waiting
            let _ = done.send(status);
        }
    }
}

/// Summary of one flush
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub items: usize,
    pub applied: usize,
    pub failed: usize,
    /// The batch script failed and items were applied one by one
    pub fell_back: bool,
}

/// Producer handle; cheap to clone
#[derive(Clone)]
pub struct BatchingPipeline {
    tx: mpsc::Sender<CounterUpdate>,
    store: Arc<CounterStore>,
    enqueue_timeout: Duration,
    metrics: Arc<CounterMetrics>,
}

impl BatchingPipeline {
    /// Create the pipeline and the worker that drains it
    pub fn new(
        store: Arc<CounterStore>,
        config: &PipelineConfig,
        metrics: Arc<CounterMetrics>,
    ) -> (Self, PipelineWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pipeline = Self {
            tx,
            store: Arc::clone(&store),
            enqueue_timeout: config.enqueue_timeout(),
            metrics: Arc::clone(&metrics),
        };
        let worker = PipelineWorker {
            rx,
            store,
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            metrics,
        };
        (pipeline, worker)
    }

    pub async fn enqueue(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> Result<EnqueueOutcome> {
        self.submit(CounterUpdate::new(CounterKey::new(user, counter_type), delta))
            .await
    }

    /// Enqueue and get notified once the delta has been applied (or has failed)
    pub async fn enqueue_tracked(
        &self,
        user: UserId,
        counter_type: CounterType,
        delta: i64,
    ) -> Result<oneshot::Receiver<UpdateStatus>> {
        let (done, rx) = oneshot::channel();
        let update = CounterUpdate {
            key: CounterKey::new(user, counter_type),
            delta,
            done: Some(done),
        };
        self.submit(update).await?;
        Ok(rx)
    }

    async fn submit(&self, update: CounterUpdate) -> Result<EnqueueOutcome> {
        match self.tx.send_timeout(update, self.enqueue_timeout).await {
            Ok(()) => Ok(EnqueueOutcome::Queued),
            Err(SendTimeoutError::Timeout(update)) => {
                warn!(
                    "Counter queue full for {:?}, applying {} to {} directly",
                    self.enqueue_timeout, update.delta, update.key
                );
                self.apply_directly(update).await
            }
            Err(SendTimeoutError::Closed(update)) => {
                debug!(
                    "Counter pipeline stopped, applying {} to {} directly",
                    update.delta, update.key
                );
                self.apply_directly(update).await
            }
        }
    }

    async fn apply_directly(&self, update: CounterUpdate) -> Result<EnqueueOutcome> {
        self.metrics.record_direct_write();
        let result = self
            .store
            .increment(update.key.user_id, update.key.counter_type, update.delta)
            .await;
        match result {
            Ok(_) => {
                update.complete(UpdateStatus::Applied);
                Ok(EnqueueOutcome::AppliedDirectly)
            }
            Err(e) => {
                update.complete(UpdateStatus::Failed);
                Err(e)
            }
        }
    }
}

/// Single consumer of the pipeline queue
pub struct PipelineWorker {
    rx: mpsc::Receiver<CounterUpdate>,
    store: Arc<CounterStore>,
    batch_size: usize,
    flush_interval: Duration,
    metrics: Arc<CounterMetrics>,
}

impl PipelineWorker {
    /// Drain the queue until shutdown is signalled, then flush what is left.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut batch: Vec<CounterUpdate> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Counter pipeline started (batch_size={}, flush_interval={:?})",
            self.batch_size, self.flush_interval
        );

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(update) => {
                        batch.push(update);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Stop accepting, then apply everything already queued
        self.rx.close();
        while let Some(update) = self.rx.recv().await {
            batch.push(update);
            if batch.len() >= self.batch_size {
                self.flush(&mut batch).await;
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        info!("Counter pipeline stopped");
    }

    async fn flush(&self, batch: &mut Vec<CounterUpdate>) -> FlushReport {
        let updates = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        flush_batch(&self.store, &self.metrics, updates).await
    }
}

/// Apply a batch with one script call, falling back to one increment per
/// item when the batch call fails.
pub async fn flush_batch(
    store: &CounterStore,
    metrics: &CounterMetrics,
    updates: Vec<CounterUpdate>,
) -> FlushReport {
    let items = updates.len();
    if items == 0 {
        return FlushReport::default();
    }

    let entries: Vec<(CounterKey, i64)> = updates.iter().map(|u| (u.key, u.delta)).collect();

    let report = match store.batch_increment(&entries).await {
        Ok(_) => {
            for update in updates {
                update.complete(UpdateStatus::Applied);
            }
            FlushReport {
                items,
                applied: items,
                failed: 0,
                fell_back: false,
            }
        }
        Err(e) => {
            warn!("Batch of {items} counter updates failed, applying individually: {e}");
            let mut report = FlushReport {
                items,
                fell_back: true,
                ..FlushReport::default()
            };
            for update in updates {
                match store
                    .increment(update.key.user_id, update.key.counter_type, update.delta)
                    .await
                {
                    Ok(_) => {
                        report.applied += 1;
                        update.complete(UpdateStatus::Applied);
                    }
                    Err(e) => {
                        error!(
                            "Dropped counter update {} ({:+}): {}",
                            update.key, update.delta, e
                        );
                        report.failed += 1;
                        update.complete(UpdateStatus::Failed);
                    }
                }
            }
            report
        }
    };

    metrics.record_flush(&report);
    debug!(
        "Flushed {}/{} counter updates (fell_back={})",
        report.applied, report.items, report.fell_back
    );
    report
}
