//! Sequential sagas with compensating rollback
//!
//! A [`Saga`] runs its steps strictly in order. When a step fails, the
//! compensations of the steps that already succeeded run in reverse order and
//! the saga ends `Failed` with the failing step's error. Compensation errors
//! are logged and recorded in the [`SagaReport`], never returned.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tally_common::{Error, Result};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::CounterMetrics;

type StepFn = Arc<dyn Fn(SagaContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Values passed between the steps of one saga, keyed by name
#[derive(Clone, Default)]
pub struct SagaContext {
    values: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl SagaContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.values.lock().insert(name.to_string(), value);
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(value) = self.values.lock().get(name).cloned() else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.lock().contains_key(name)
    }
}

impl fmt::Debug for SagaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.values.lock().iter()).finish()
    }
}

/// A named action with an optional compensation
pub struct SagaStep {
    name: String,
    execute: StepFn,
    compensate: Option<StepFn>,
}

impl SagaStep {
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |ctx| execute(ctx).boxed()),
            compensate: None,
        }
    }

    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |ctx| compensate(ctx).boxed()));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}

impl fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("compensable", &self.has_compensation())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SagaState {
    Created,
    Running,
    Compensating,
    Completed,
    Failed,
}

impl SagaState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened while a saga ran
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SagaReport {
    /// Steps that succeeded, in execution order
    pub executed: Vec<String>,
    /// Steps whose compensation succeeded, in compensation order
    pub compensated: Vec<String>,
    /// Steps whose compensation failed
    pub compensation_failures: Vec<String>,
    pub failed_step: Option<String>,
}

pub struct Saga {
    id: String,
    name: String,
    steps: Vec<SagaStep>,
    context: SagaContext,
    state: Mutex<SagaState>,
    report: Mutex<SagaReport>,
    run_lock: tokio::sync::Mutex<()>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("{}_{}", name, Uuid::new_v4()),
            name,
            steps: Vec::new(),
            context: SagaContext::new(),
            state: Mutex::new(SagaState::Created),
            report: Mutex::new(SagaReport::default()),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn add_step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> SagaState {
        *self.state.lock()
    }

    #[must_use]
    pub fn report(&self) -> SagaReport {
        self.report.lock().clone()
    }

    #[must_use]
    pub const fn context(&self) -> &SagaContext {
        &self.context
    }

    #[must_use]
    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    fn set_state(&self, state: SagaState) {
        *self.state.lock() = state;
    }

    /// Run the steps once; a saga cannot be executed twice
    pub async fn execute(&self) -> Result<()> {
        let _running = self.run_lock.lock().await;
        {
            let mut state = self.state.lock();
            if *state != SagaState::Created {
                return Err(Error::SagaAlreadyExecuted {
                    saga: self.id.clone(),
                    state: state.to_string(),
                });
            }
            *state = SagaState::Running;
        }

        debug!("SAGA {} started with {} steps", self.id, self.steps.len());

        let mut executed: Vec<&SagaStep> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            if let Err(err) = (step.execute)(self.context.clone()).await {
                warn!("SAGA {}: step {} failed: {}", self.id, step.name, err);
                self.report.lock().failed_step = Some(step.name.clone());
                self.set_state(SagaState::Compensating);
                self.compensate(&executed).await;
                self.set_state(SagaState::Failed);
                return Err(Error::SagaStepFailure {
                    saga: self.name.clone(),
                    step: step.name.clone(),
                    source: Box::new(err),
                });
            }
            self.report.lock().executed.push(step.name.clone());
            executed.push(step);
        }

        self.set_state(SagaState::Completed);
        info!("SAGA {} completed successfully", self.id);
        Ok(())
    }

    async fn compensate(&self, executed: &[&SagaStep]) {
        for step in executed.iter().rev() {
            let Some(compensate) = &step.compensate else {
                continue;
            };
            match compensate(self.context.clone()).await {
                Ok(()) => {
                    info!("SAGA {}: compensated step {}", self.id, step.name);
                    self.report.lock().compensated.push(step.name.clone());
                }
                Err(e) => {
                    error!(
                        "SAGA {}: compensation failed for step {}: {}",
                        self.id, step.name, e
                    );
                    self.report
                        .lock()
                        .compensation_failures
                        .push(step.name.clone());
                }
            }
        }
    }
}

impl fmt::Debug for Saga {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}

/// Tracks a running saga; the entry goes away when the run finishes, is
/// cancelled or panics
struct ActiveEntry<'a> {
    active: &'a DashMap<String, String>,
    id: &'a str,
}

impl<'a> ActiveEntry<'a> {
    fn register(active: &'a DashMap<String, String>, saga: &'a Saga) -> Self {
        active.insert(saga.id().to_string(), saga.name().to_string());
        Self {
            active,
            id: saga.id(),
        }
    }
}

impl Drop for ActiveEntry<'_> {
    fn drop(&mut self) {
        self.active.remove(self.id);
    }
}

/// Runs sagas and keeps track of the ones in flight
pub struct SagaOrchestrator {
    active: DashMap<String, String>,
    metrics: Arc<CounterMetrics>,
}

impl SagaOrchestrator {
    #[must_use]
    pub fn new(metrics: Arc<CounterMetrics>) -> Self {
        Self {
            active: DashMap::new(),
            metrics,
        }
    }

    pub async fn run(&self, saga: &Saga) -> Result<()> {
        let result = {
            let _active = ActiveEntry::register(&self.active, saga);
            saga.execute().await
        };

        let report = saga.report();
        self.metrics.record_saga(
            result.is_ok(),
            report.compensated.len(),
            report.compensation_failures.len(),
        );
        result
    }

    /// Build a saga from `steps` and run it
    pub async fn run_steps(&self, name: &str, steps: Vec<SagaStep>) -> Result<()> {
        let saga = steps.into_iter().fold(Saga::new(name), Saga::add_step);
        self.run(&saga).await
    }

    /// Number of sagas currently executing
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// `(id, name)` of every saga currently executing
    #[must_use]
    pub fn active_sagas(&self) -> Vec<(String, String)> {
        self.active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
