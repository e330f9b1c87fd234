use tracing::{debug, info, warn};

use momentaic_core::types::{
    Context, RunEvent, RunId, RunKind, RunResult, RunStatus, StepStatus,
};

use crate::executor::{RunOptions, TaskGraphExecutor};
use crate::invoke::invoke;

impl TaskGraphExecutor {
    /// Run workers strictly in order, threading the accumulated context.
    ///
    /// Each step sees the initial context with every earlier step's output
    /// merged on top (later keys win). Failures are recorded in the step and
    /// never returned as errors. With `stop_on_error`, the steps after a
    /// failure stay `pending`.
    pub async fn execute_chain<I, S>(
        &self,
        workers: I,
        initial_context: Context,
        options: RunOptions,
    ) -> RunResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = workers.into_iter().map(Into::into).collect();
        let run_id = RunId::new();
        let mut run = RunResult::chain(run_id.clone(), &names);
        self.history.insert(run.clone());

        info!(run_id = %run_id, steps = names.len(), "Chain run started");
        self.publish(RunEvent::RunStarted {
            run_id: run_id.clone(),
            kind: RunKind::Chain,
            steps: names.len(),
        });

        let mut accumulated = initial_context;
        let mut last_output: Option<Context> = None;

        for (index, name) in names.iter().enumerate() {
            let input = accumulated.clone();
            if let Some(step) = run.chain_step_mut(index) {
                step.start(input.clone());
            }
            self.history.sync(&mut run);
            self.publish(RunEvent::StepStarted {
                run_id: run_id.clone(),
                step: index.to_string(),
                worker: name.clone(),
            });
            debug!(run_id = %run_id, step = index, worker = %name, "Chain step started");

            let outcome = match self.registry.resolve(name) {
                Ok(worker) => {
                    invoke(worker.as_ref(), name, &input, options.timeout_per_step).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(output) => {
                    accumulated.extend(output.clone());
                    last_output = Some(output.clone());
                    let mut duration_secs = 0.0;
                    if let Some(step) = run.chain_step_mut(index) {
                        step.complete(output);
                        duration_secs = step.duration_secs().unwrap_or(0.0);
                    }
                    self.publish(RunEvent::StepCompleted {
                        run_id: run_id.clone(),
                        step: index.to_string(),
                        worker: name.clone(),
                        duration_secs,
                    });
                    debug!(run_id = %run_id, step = index, worker = %name, duration_secs, "Chain step completed");
                }
                Err(e) => {
                    let error = e.to_string();
                    warn!(run_id = %run_id, step = index, worker = %name, error = %error, "Chain step failed");
                    if let Some(step) = run.chain_step_mut(index) {
                        step.fail(error.clone());
                    }
                    self.publish(RunEvent::StepFailed {
                        run_id: run_id.clone(),
                        step: index.to_string(),
                        worker: name.clone(),
                        error,
                    });
                    if options.stop_on_error {
                        info!(run_id = %run_id, remaining = names.len() - index - 1, "Stopping chain after failure");
                        break;
                    }
                }
            }
            self.history.sync(&mut run);
        }

        run.final_output = last_output;
        let status = chain_status(&run);
        run.finish(status);
        self.history.sync(&mut run);

        let duration_secs = run.total_duration_secs().unwrap_or(0.0);
        info!(run_id = %run_id, status = ?run.status, duration_secs, "Chain run finished");
        self.publish(RunEvent::RunFinished {
            run_id,
            status: run.status,
            duration_secs,
        });

        run
    }
}

/// `completed` with no failures, `partial` with some of each, else `failed`.
fn chain_status(run: &RunResult) -> RunStatus {
    let failed = run.count(StepStatus::Failed);
    let completed = run.count(StepStatus::Completed);
    if failed == 0 {
        RunStatus::Completed
    } else if completed > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}
