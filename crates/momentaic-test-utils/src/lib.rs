//! Shared test utilities: fake workers, call recording, and config fixtures.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use momentaic_core::error::{MomentaicError, Result};
use momentaic_core::traits::Worker;
use momentaic_core::types::{Capability, Context, WorkerInput, WorkerOutput};

/// Build a context from a JSON object literal. Panics on non-objects.
pub fn ctx(value: serde_json::Value) -> Context {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// One recorded worker call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub worker: String,
    pub input: WorkerInput,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Shared log of calls, in completion order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, record: CallRecord) {
        self.calls.lock().unwrap().push(record);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    /// Worker names in completion order.
    pub fn order(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.worker).collect()
    }

    pub fn get(&self, worker: &str) -> Option<CallRecord> {
        self.calls().into_iter().find(|c| c.worker == worker)
    }

    /// Highest number of calls that overlapped in time.
    pub fn max_overlap(&self) -> usize {
        let calls = self.calls();
        calls
            .iter()
            .map(|a| {
                calls
                    .iter()
                    .filter(|b| b.started_at < a.finished_at && a.started_at < b.finished_at)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }
}

enum Behavior {
    Reply(WorkerOutput),
    Fail(String),
}

/// Configurable fake worker.
///
/// Replies with a fixed output (or fails) after an optional delay, and can
/// record every call into a [`CallLog`].
pub struct FakeWorker {
    name: String,
    capabilities: Vec<Capability>,
    behavior: Behavior,
    delay: Duration,
    timeout_secs: Option<f64>,
    log: Option<CallLog>,
}

impl FakeWorker {
    /// Analyze-capable worker that replies with `output`.
    pub fn replying(name: &str, output: impl Into<WorkerOutput>) -> Self {
        Self {
            name: name.to_string(),
            capabilities: vec![Capability::Analyze],
            behavior: Behavior::Reply(output.into()),
            delay: Duration::ZERO,
            timeout_secs: None,
            log: None,
        }
    }

    /// Worker whose every call fails with `message`.
    pub fn failing(name: &str, message: &str) -> Self {
        Self {
            behavior: Behavior::Fail(message.to_string()),
            ..Self::replying(name, WorkerOutput::Value(serde_json::Value::Null))
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn recording(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }
}

impl Worker for FakeWorker {
    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn call(&self, input: WorkerInput) -> BoxFuture<'_, Result<WorkerOutput>> {
        Box::pin(async move {
            let started_at = Utc::now();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(log) = &self.log {
                log.push(CallRecord {
                    worker: self.name.clone(),
                    input,
                    started_at,
                    finished_at: Utc::now(),
                });
            }
            match &self.behavior {
                Behavior::Reply(output) => Ok(output.clone()),
                Behavior::Fail(message) => Err(MomentaicError::WorkerRuntime(message.clone())),
            }
        })
    }

    fn timeout_secs(&self) -> Option<f64> {
        self.timeout_secs
    }
}

/// Write `contents` to `momentaic.toml` in a fresh temp dir.
///
/// Keep the returned `TempDir` alive for as long as the file is needed.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("momentaic.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// Parse a TOML snippet, for asserting on config fragments.
pub fn parse_toml(contents: &str) -> toml::Value {
    contents.parse().unwrap()
}
