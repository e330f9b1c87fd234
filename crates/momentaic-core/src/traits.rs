use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Capability, WorkerInput, WorkerOutput};

/// An opaque unit of work invoked by name.
///
/// Every worker declares which calling conventions it supports. The
/// invocation adapter picks one, shapes the input for it, and calls
/// [`Worker::call`].
pub trait Worker: Send + Sync + 'static {
    /// Capabilities this worker exposes. Empty means none are supported.
    fn capabilities(&self) -> &[Capability];

    /// Run the worker for the chosen capability.
    fn call(&self, input: WorkerInput) -> BoxFuture<'_, Result<WorkerOutput>>;

    /// Per-worker timeout override in seconds.
    fn timeout_secs(&self) -> Option<f64> {
        None
    }
}
