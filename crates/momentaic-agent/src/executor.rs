use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::info;

use momentaic_core::config::ExecutorConfig;
use momentaic_core::event::EventBus;
use momentaic_core::types::{RunEvent, RunId, RunResult};

use crate::history::RunHistory;
use crate::registry::WorkerRegistry;

/// Per-run options for chains and DAGs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunOptions {
    /// Abort the run on the first failed step.
    pub stop_on_error: bool,
    /// Timeout for each worker invocation.
    pub timeout_per_step: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            timeout_per_step: Duration::from_secs(300),
        }
    }
}

impl RunOptions {
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_step = timeout;
        self
    }
}

impl From<&ExecutorConfig> for RunOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            stop_on_error: config.stop_on_error,
            timeout_per_step: config.timeout_per_step(),
        }
    }
}

/// Runs chains and DAGs of registered workers.
///
/// `execute_chain` lives in `chain.rs`, `execute_dag` in `graph/executor.rs`.
/// Both record every run in a bounded history so callers can poll
/// [`get_run_status`](Self::get_run_status) while it executes.
pub struct TaskGraphExecutor {
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) history: Arc<RunHistory>,
    pub(crate) event_bus: Option<Arc<EventBus>>,
    /// Caps how many DAG nodes invoke workers at once. `None` = unbounded.
    pub(crate) limiter: Option<Arc<Semaphore>>,
    defaults: RunOptions,
}

impl TaskGraphExecutor {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self::from_config(registry, &ExecutorConfig::default())
    }

    pub fn from_config(registry: Arc<WorkerRegistry>, config: &ExecutorConfig) -> Self {
        Self {
            registry,
            history: Arc::new(RunHistory::new(config.run_history_capacity)),
            event_bus: None,
            limiter: config
                .concurrency_limit()
                .map(|n| Arc::new(Semaphore::new(n))),
            defaults: RunOptions::from(config),
        }
    }

    /// Publish run events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Bound DAG fan-out to `n` concurrent worker invocations (0 = unbounded).
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.limiter = (n > 0).then(|| Arc::new(Semaphore::new(n)));
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history = Arc::new(RunHistory::new(capacity));
        self
    }

    /// Options from the executor configuration.
    pub fn default_options(&self) -> RunOptions {
        self.defaults
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Snapshot of a tracked run, or `None` if it is unknown or was evicted.
    pub fn get_run_status(&self, run_id: &str) -> Option<RunResult> {
        self.history.get(run_id)
    }

    /// Flag a running run as failed/cancelled.
    ///
    /// This does not interrupt worker invocations already in flight, nor stop
    /// the executor from running later steps. Returns false if the run is
    /// unknown or already finished.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let cancelled = self.history.cancel(run_id);
        if cancelled {
            info!(run_id = %run_id, "Run flagged as cancelled");
            self.publish(RunEvent::RunCancelled {
                run_id: RunId::from_string(run_id),
            });
        }
        cancelled
    }

    pub(crate) fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}
