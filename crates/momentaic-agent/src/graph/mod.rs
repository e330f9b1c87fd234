//! DAG execution.
//!
//! A `TaskGraph` maps node ids to `DagNode`s, each naming a worker and the
//! nodes it depends on. `TaskGraphExecutor::execute_dag` validates the graph,
//! then starts every node as soon as all of its dependencies completed, so
//! independent branches run concurrently.

pub mod executor;
pub mod node;

pub use node::{DagNode, TaskGraph};
