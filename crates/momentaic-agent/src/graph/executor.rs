use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use momentaic_core::error::{MomentaicError, Result};
use momentaic_core::event::EventBus;
use momentaic_core::types::{
    Context, RunEvent, RunId, RunKind, RunResult, RunStatus, StepRecord, StepStatus,
};

use super::node::{DagNode, TaskGraph};
use crate::executor::{RunOptions, TaskGraphExecutor};
use crate::history::RunHistory;
use crate::invoke::invoke;
use crate::registry::WorkerRegistry;

/// What a node left behind for its dependents: its output or its error.
type NodeOutcome = std::result::Result<Context, String>;

/// Completion signal. `None` until the node settles.
type Signal = watch::Receiver<Option<NodeOutcome>>;

const ABORTED: &str = "Run aborted after node failure";

/// State shared by every node task of one DAG run.
struct DagRun {
    run_id: RunId,
    registry: Arc<WorkerRegistry>,
    history: Arc<RunHistory>,
    event_bus: Option<Arc<EventBus>>,
    limiter: Option<Arc<Semaphore>>,
    options: RunOptions,
    initial_context: Context,
    result: Mutex<RunResult>,
    /// Tripped by the first failure when `stop_on_error` is set.
    abort: CancellationToken,
}

impl TaskGraphExecutor {
    /// Run a dependency graph of workers.
    ///
    /// Every node gets its own task up front and waits for its dependencies'
    /// completion signals. A node's input is the initial context plus, for
    /// each dependency in declared order, `"{dep}_output"` and the
    /// dependency's output keys merged flat (later dependencies win).
    ///
    /// Returns an error only when the graph is invalid (unknown dependency
    /// or cycle); node failures are recorded in the result. Any failed or
    /// skipped node makes the whole run `failed`.
    pub async fn execute_dag(
        &self,
        graph: &TaskGraph,
        initial_context: Context,
        options: RunOptions,
    ) -> Result<RunResult> {
        graph.validate()?;

        let run_id = RunId::new();
        let records: BTreeMap<String, StepRecord> = graph
            .nodes()
            .iter()
            .map(|(id, node)| {
                (
                    id.clone(),
                    StepRecord::dag_node(node.worker.clone(), id.clone(), node.depends_on.clone()),
                )
            })
            .collect();
        let run = RunResult::dag(run_id.clone(), records);
        self.history.insert(run.clone());

        info!(run_id = %run_id, nodes = graph.len(), "DAG run started");
        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            kind: RunKind::Dag,
            steps: graph.len(),
        });

        let shared = Arc::new(DagRun {
            run_id: run_id.clone(),
            registry: self.registry.clone(),
            history: self.history.clone(),
            event_bus: self.event_bus.clone(),
            limiter: self.limiter.clone(),
            options,
            initial_context,
            result: Mutex::new(run),
            abort: CancellationToken::new(),
        });

        let mut senders = BTreeMap::new();
        let mut signals: BTreeMap<&str, Signal> = BTreeMap::new();
        for id in graph.nodes().keys() {
            let (tx, rx) = watch::channel(None);
            senders.insert(id.clone(), tx);
            signals.insert(id.as_str(), rx);
        }

        let mut handles = Vec::with_capacity(graph.len());
        for (id, node) in graph.nodes() {
            let deps: Vec<(String, Signal)> = node
                .depends_on
                .iter()
                .map(|dep| (dep.clone(), signals[dep.as_str()].clone()))
                .collect();
            let Some(signal) = senders.remove(id) else {
                continue;
            };
            let shared = shared.clone();
            let node_id = id.clone();
            let node = node.clone();
            let handle = tokio::spawn(async move {
                let outcome = run_node(&shared, &node_id, &node, deps).await;
                signal.send_replace(Some(match &outcome {
                    Ok(output) => Ok(output.clone()),
                    Err(e) => Err(e.to_string()),
                }));
                outcome.map(|_| ())
            });
            handles.push((id.clone(), handle));
        }
        drop(signals);

        // Node errors are collected here rather than propagated, so the run
        // always settles with every node accounted for.
        let mut errors = 0usize;
        for (node_id, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    errors += 1;
                    debug!(run_id = %run_id, node = %node_id, error = %e, "Node settled with error");
                }
                Err(join_err) => {
                    errors += 1;
                    error!(run_id = %run_id, node = %node_id, error = %join_err, "Node task panicked");
                    let mut result = shared.lock_result();
                    if let Some(record) = result.node_mut(&node_id) {
                        record.fail(format!("Node task panicked: {}", join_err));
                    }
                }
            }
        }

        let mut run = shared.lock_result().clone();
        let failed = errors > 0
            || run.count(StepStatus::Failed) > 0
            || run.count(StepStatus::Skipped) > 0;
        run.finish(if failed {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        });
        self.history.sync(&mut run);

        let duration_secs = run.total_duration_secs().unwrap_or(0.0);
        info!(run_id = %run_id, status = ?run.status, duration_secs, "DAG run finished");
        self.publish(RunEvent::RunFinished {
            run_id,
            status: run.status,
            duration_secs,
        });

        Ok(run)
    }
}

/// Wait for dependencies, then invoke the node's worker.
async fn run_node(
    run: &DagRun,
    node_id: &str,
    node: &DagNode,
    deps: Vec<(String, Signal)>,
) -> Result<Context> {
    let mut upstream: Vec<(String, Context)> = Vec::with_capacity(deps.len());
    for (dep_id, mut signal) in deps {
        let outcome = match signal.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            // Sender dropped without settling: the dependency's task died.
            Err(_) => None,
        };
        match outcome {
            Some(Ok(output)) => upstream.push((dep_id, output)),
            Some(Err(_)) | None => {
                let err = MomentaicError::DependencyFailed {
                    node: node_id.to_string(),
                    dependency: dep_id,
                };
                if run.options.stop_on_error {
                    run.skip(node_id, err.to_string());
                } else {
                    run.fail(node_id, &node.worker, err.to_string());
                }
                return Err(err);
            }
        }
    }

    if run.abort.is_cancelled() {
        run.skip(node_id, ABORTED);
        return Err(MomentaicError::WorkerRuntime(ABORTED.into()));
    }

    let _permit = match &run.limiter {
        Some(limiter) => limiter.clone().acquire_owned().await.ok(),
        None => None,
    };
    // The abort may have tripped while this node queued for a permit.
    if run.abort.is_cancelled() {
        run.skip(node_id, ABORTED);
        return Err(MomentaicError::WorkerRuntime(ABORTED.into()));
    }

    let mut context = run.initial_context.clone();
    for (dep_id, output) in upstream {
        context.insert(
            format!("{}_output", dep_id),
            serde_json::Value::Object(output.clone()),
        );
        context.extend(output);
    }

    run.start(node_id, &node.worker, context.clone());

    let outcome = match run.registry.resolve(&node.worker) {
        Ok(worker) => {
            invoke(
                worker.as_ref(),
                &node.worker,
                &context,
                run.options.timeout_per_step,
            )
            .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(output) => {
            run.complete(node_id, &node.worker, output.clone());
            Ok(output)
        }
        Err(e) => {
            warn!(run_id = %run.run_id, node = %node_id, worker = %node.worker, error = %e, "DAG node failed");
            run.fail(node_id, &node.worker, e.to_string());
            if run.options.stop_on_error {
                run.abort.cancel();
            }
            Err(e)
        }
    }
}

impl DagRun {
    fn lock_result(&self) -> MutexGuard<'_, RunResult> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to the node's record and push the snapshot to the history.
    fn update(&self, node_id: &str, f: impl FnOnce(&mut StepRecord)) -> Option<f64> {
        let mut result = self.lock_result();
        let duration = result.node_mut(node_id).and_then(|record| {
            f(record);
            record.duration_secs()
        });
        self.history.sync(&mut result);
        duration
    }

    fn publish(&self, event: RunEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    fn start(&self, node_id: &str, worker: &str, input: Context) {
        self.update(node_id, |record| record.start(input));
        debug!(run_id = %self.run_id, node = %node_id, worker = %worker, "DAG node started");
        self.publish(RunEvent::StepStarted {
            run_id: self.run_id.clone(),
            step: node_id.to_string(),
            worker: worker.to_string(),
        });
    }

    fn complete(&self, node_id: &str, worker: &str, output: Context) {
        self.lock_result().final_output = Some(output.clone());
        let duration_secs = self
            .update(node_id, |record| record.complete(output))
            .unwrap_or(0.0);
        debug!(run_id = %self.run_id, node = %node_id, duration_secs, "DAG node completed");
        self.publish(RunEvent::StepCompleted {
            run_id: self.run_id.clone(),
            step: node_id.to_string(),
            worker: worker.to_string(),
            duration_secs,
        });
    }

    fn fail(&self, node_id: &str, worker: &str, error: String) {
        self.update(node_id, |record| record.fail(error.clone()));
        self.publish(RunEvent::StepFailed {
            run_id: self.run_id.clone(),
            step: node_id.to_string(),
            worker: worker.to_string(),
            error,
        });
    }

    fn skip(&self, node_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        debug!(run_id = %self.run_id, node = %node_id, reason = %reason, "DAG node skipped");
        self.update(node_id, |record| record.skip(reason.clone()));
        self.publish(RunEvent::StepSkipped {
            run_id: self.run_id.clone(),
            step: node_id.to_string(),
            reason,
        });
    }
}
