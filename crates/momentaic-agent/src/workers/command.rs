use std::process::Stdio;
use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use momentaic_core::config::WorkerConfig;
use momentaic_core::error::{MomentaicError, Result};
use momentaic_core::traits::Worker;
use momentaic_core::types::{Capability, Context, WorkerInput, WorkerOutput};

/// A worker that runs a shell command.
///
/// The worker input is written to the command's stdin as one JSON document:
/// `{"capability": ..., "message": ..., "context": {...}}`. Stdout is parsed
/// by [`parse_reply`]. The child is killed if the invocation is dropped, so
/// step timeouts do not leak processes.
pub struct CommandWorker {
    name: String,
    config: WorkerConfig,
}

#[derive(Serialize)]
struct CommandRequest<'a> {
    worker: &'a str,
    capability: Capability,
    message: Option<&'a str>,
    context: &'a Context,
}

impl CommandWorker {
    pub fn new(name: impl Into<String>, config: WorkerConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    async fn run(&self, input: WorkerInput) -> Result<WorkerOutput> {
        let request = serde_json::to_vec(&CommandRequest {
            worker: &self.name,
            capability: input.capability,
            message: input.message.as_deref(),
            context: &input.context,
        })?;

        let mut command = tokio::process::Command::new("sh");
        command.args(["-c", &self.config.command]);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, val) in &self.config.env {
            command.env(key, val);
        }
        command.env("MOMENTAIC_WORKER", &self.name);
        command.env("MOMENTAIC_CAPABILITY", input.capability.as_str());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            MomentaicError::WorkerRuntime(format!("Failed to spawn '{}': {}", self.config.command, e))
        })?;

        // Stdout is drained while the request is written, so a command that
        // echoes its input cannot fill both pipes and stall.
        let stdin = child.stdin.take();
        let write_request = async {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A command that ignores its input may exit before reading it.
            match stdin.write_all(&request).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(worker = %self.name, "Command closed stdin before reading input");
                    Ok(())
                }
                result => result,
            }
        };

        let (written, output) = tokio::join!(write_request, child.wait_with_output());
        written?;
        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(worker = %self.name, code = output.status.code(), "Worker command exited non-zero");
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(MomentaicError::WorkerRuntime(format!(
                "Command exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                detail
            )));
        }

        Ok(parse_reply(&stdout))
    }
}

impl Worker for CommandWorker {
    fn capabilities(&self) -> &[Capability] {
        &self.config.capabilities
    }

    fn call(&self, input: WorkerInput) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(self.run(input))
    }

    fn timeout_secs(&self) -> Option<f64> {
        self.config.timeout_secs
    }
}

fn json_object_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)\{.*\}").unwrap())
}

/// Interpret a worker reply.
///
/// Whole-reply JSON wins. Otherwise the outermost `{...}` span embedded in the
/// text is tried, since agents often wrap JSON in prose or code fences. Any
/// other reply is returned as text.
pub fn parse_reply(raw: &str) -> WorkerOutput {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return WorkerOutput::from(value);
    }

    if let Some(m) = json_object_pattern().find(trimmed) {
        if let Ok(serde_json::Value::Object(map)) =
            serde_json::from_str::<serde_json::Value>(m.as_str())
        {
            return WorkerOutput::Map(map);
        }
    }

    WorkerOutput::Text(trimmed.to_string())
}
