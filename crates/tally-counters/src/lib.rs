//! Tally Counters - denormalized counters kept honest
//!
//! This crate provides:
//! - **RedisCache / MemoryCache**: the shared scripted cache and its
//!   in-process stand-in
//! - **CounterStore**: atomic counter operations as cache scripts, with
//!   optimistic versioning and a degraded non-atomic fallback
//! - **BatchingPipeline**: bounded queue and worker that applies deltas in batches
//! - **Saga**: sequential steps with compensating rollback, and the message
//!   sagas built on it
//! - **Reconciler / ConsistencyChecker**: recompute counters from the durable
//!   store and repair drift
//! - **CounterService**: the facade owning all of the above and the
//!   background tasks

pub mod cache;
pub mod flows;
pub mod metrics;
pub mod pipeline;
pub mod reconcile;
pub mod redis_cache;
pub mod saga;
pub mod script;
pub mod service;
pub mod store;

pub use cache::{CacheBackend, MemoryCache};
pub use flows::{LogNotifier, MessageSagas, Notification, Notifier};
pub use metrics::CounterMetrics;
pub use pipeline::{BatchingPipeline, EnqueueOutcome, FlushReport, PipelineWorker, UpdateStatus};
pub use reconcile::{
    CheckReport, ConsistencyChecker, PassReport, ReconcileOutcome, Reconciler,
    drift_exceeds_tolerance,
};
pub use redis_cache::RedisCache;
pub use saga::{Saga, SagaContext, SagaOrchestrator, SagaReport, SagaState, SagaStep};
pub use script::{CounterRecord, Script, ScriptCall, ScriptReply};
pub use service::{BackgroundTasks, CounterService, CounterStats};
pub use store::{CounterCompensation, CounterStore};
