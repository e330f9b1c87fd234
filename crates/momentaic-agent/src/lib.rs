pub mod chain;
pub mod executor;
pub mod graph;
pub mod history;
pub mod invoke;
pub mod registry;
pub mod run_log;
pub mod workers;

pub use executor::{RunOptions, TaskGraphExecutor};
pub use graph::{DagNode, TaskGraph};
pub use history::RunHistory;
pub use invoke::invoke;
pub use registry::WorkerRegistry;
pub use run_log::RunLogger;
pub use workers::{CommandWorker, FnWorker};
