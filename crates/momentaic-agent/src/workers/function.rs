use std::future::Future;

use futures::future::BoxFuture;

use momentaic_core::error::Result;
use momentaic_core::traits::Worker;
use momentaic_core::types::{Capability, WorkerInput, WorkerOutput};

/// A worker backed by an async closure.
pub struct FnWorker<F> {
    capabilities: Vec<Capability>,
    timeout_secs: Option<f64>,
    f: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(WorkerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerOutput>> + Send + 'static,
{
    pub fn new(capabilities: Vec<Capability>, f: F) -> Self {
        Self {
            capabilities,
            timeout_secs: None,
            f,
        }
    }

    /// Cap the executor's per-step timeout for this worker.
    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(WorkerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkerOutput>> + Send + 'static,
{
    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn call(&self, input: WorkerInput) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin((self.f)(input))
    }

    fn timeout_secs(&self) -> Option<f64> {
        self.timeout_secs
    }
}
