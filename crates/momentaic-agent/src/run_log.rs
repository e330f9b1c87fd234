use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use momentaic_core::event::EventBus;
use momentaic_core::types::{RunEvent, RunId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for a
/// single run. Every line is flushed as it is written, so a crash leaves all
/// earlier entries intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    ///
    /// `level`: 1 = run lifecycle only, 2 = plus step outcomes, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events for one run until it finishes or `cancel` fires.
    ///
    /// Subscribes immediately, so events published after this call are seen
    /// even before the returned future is first polled. With `run_id = None`
    /// the logger follows the first run that starts after that. The log file
    /// is created on the run's first event. The future resolves to the path
    /// of the log file, or `None` if nothing was written.
    pub fn run(
        self,
        event_bus: Arc<EventBus>,
        run_id: Option<RunId>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Option<PathBuf>> + Send + 'static {
        let rx = event_bus.subscribe();
        self.follow(rx, run_id, cancel)
    }

    async fn follow(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: Option<RunId>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let mut run_id = run_id;
        let mut writer: Option<(PathBuf, BufWriter<File>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let ours = match &run_id {
                                Some(id) => event.run_id() == id,
                                None => matches!(event, RunEvent::RunStarted { .. }),
                            };
                            if !ours {
                                continue;
                            }
                            if run_id.is_none() {
                                run_id = Some(event.run_id().clone());
                            }

                            if writer.is_none() {
                                match self.open(event.run_id()).await {
                                    Some(opened) => writer = Some(opened),
                                    None => return None,
                                }
                            }
                            if let (Some((_, out)), Some(entry)) =
                                (writer.as_mut(), self.event_to_entry(&event))
                            {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = out.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = out.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }

                            if matches!(event, RunEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        let (path, mut out) = writer?;
        out.flush().await.ok();
        debug!(path = %path.display(), "RunLogger finished");
        Some(path)
    }

    /// Create `{log_dir}/{run_id}/{timestamp}.jsonl` for appending.
    async fn open(&self, run_id: &RunId) -> Option<(PathBuf, BufWriter<File>)> {
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(file) => {
                info!(path = %log_path.display(), "RunLogger started");
                Some((log_path, BufWriter::new(file)))
            }
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |event_type, step: Option<&String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            step: step.cloned(),
            detail,
        };

        match event {
            // L1: run lifecycle
            RunEvent::RunStarted { kind, steps, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "kind": kind, "steps": steps })),
            )),
            RunEvent::RunFinished {
                status,
                duration_secs,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status, "duration_secs": duration_secs })),
            )),
            RunEvent::RunCancelled { .. } => Some(entry("run_cancelled", None, None)),

            // L2: step outcomes
            RunEvent::StepCompleted {
                step,
                worker,
                duration_secs,
                ..
            } if self.level >= 2 => Some(entry(
                "step_completed",
                Some(step),
                Some(serde_json::json!({ "worker": worker, "duration_secs": duration_secs })),
            )),
            RunEvent::StepFailed {
                step, worker, error, ..
            } if self.level >= 2 => Some(entry(
                "step_failed",
                Some(step),
                Some(serde_json::json!({ "worker": worker, "error": truncate_str(error, 500) })),
            )),
            RunEvent::StepSkipped { step, reason, .. } if self.level >= 2 => Some(entry(
                "step_skipped",
                Some(step),
                Some(serde_json::json!({ "reason": reason })),
            )),

            // L3: step starts
            RunEvent::StepStarted { step, worker, .. } if self.level >= 3 => Some(entry(
                "step_started",
                Some(step),
                Some(serde_json::json!({ "worker": worker })),
            )),

            _ => None,
        }
    }
}

/// Truncate on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
