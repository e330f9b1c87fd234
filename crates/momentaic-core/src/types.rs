use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

/// Accumulated context threaded between steps. Keys are strings, values JSON.
pub type Context = serde_json::Map<String, serde_json::Value>;

/// Context keys the invocation adapter composes into a worker message.
pub const TASK_NAME_KEY: &str = "task_name";
pub const TASK_DESCRIPTION_KEY: &str = "task_description";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of calling conventions a worker can expose.
///
/// When a worker exposes several, the adapter calls the first one in
/// [`Capability::PRECEDENCE`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// `process(message, context)`
    Process,
    /// `generate(topic, context)`
    Generate,
    /// `analyze(data)`
    Analyze,
    /// `execute(task, context)`
    Execute,
    /// `route(query, context)`
    Route,
}

impl Capability {
    pub const PRECEDENCE: [Capability; 5] = [
        Capability::Process,
        Capability::Generate,
        Capability::Analyze,
        Capability::Execute,
        Capability::Route,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Process => "process",
            Capability::Generate => "generate",
            Capability::Analyze => "analyze",
            Capability::Execute => "execute",
            Capability::Route => "route",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments handed to a worker, shaped for the capability being called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub capability: Capability,
    /// Composed message, topic, task or query. `None` for `analyze`.
    #[serde(default)]
    pub message: Option<String>,
    pub context: Context,
}

/// Raw worker return value, before normalization into a mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutput {
    Text(String),
    Map(Context),
    Value(serde_json::Value),
}

impl From<String> for WorkerOutput {
    fn from(s: String) -> Self {
        WorkerOutput::Text(s)
    }
}

impl From<&str> for WorkerOutput {
    fn from(s: &str) -> Self {
        WorkerOutput::Text(s.to_string())
    }
}

impl From<Context> for WorkerOutput {
    fn from(map: Context) -> Self {
        WorkerOutput::Map(map)
    }
}

impl From<serde_json::Value> for WorkerOutput {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => WorkerOutput::Text(s),
            serde_json::Value::Object(map) => WorkerOutput::Map(map),
            other => WorkerOutput::Value(other),
        }
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not attempted (yet).
    Pending,
    Running,
    Completed,
    Failed,
    /// Deliberately not run because the run was aborted.
    Skipped,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Still executing; only visible through the run history.
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Whether a run was a linear chain or a dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Chain,
    Dag,
}

/// One invocation of a worker within a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepRecord {
    pub worker: String,
    /// Position within a chain.
    #[serde(default)]
    pub order: Option<usize>,
    /// Node id within a DAG.
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub status: StepStatus,
    /// Context snapshot the worker was invoked with.
    #[serde(default)]
    pub input: Option<Context>,
    #[serde(default)]
    pub output: Option<Context>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// A pending chain step.
    pub fn chain_step(worker: impl Into<String>, order: usize) -> Self {
        Self {
            worker: worker.into(),
            order: Some(order),
            node_id: None,
            depends_on: vec![],
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// A pending DAG node.
    pub fn dag_node(
        worker: impl Into<String>,
        node_id: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            node_id: Some(node_id.into()),
            order: None,
            depends_on,
            ..Self::chain_step(worker, 0)
        }
    }

    /// Identifier used in events and logs: the node id, or the chain index.
    pub fn key(&self) -> String {
        match (&self.node_id, self.order) {
            (Some(id), _) => id.clone(),
            (None, Some(order)) => order.to_string(),
            (None, None) => self.worker.clone(),
        }
    }

    pub fn start(&mut self, input: Context) {
        self.status = StepStatus::Running;
        self.input = Some(input);
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, output: Context) {
        self.status = StepStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
    }

    /// Seconds between start and end, derived from the timestamps.
    pub fn duration_secs(&self) -> Option<f64> {
        duration_between(self.started_at, self.completed_at)
    }
}

impl Serialize for StepRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("StepRecord", 11)?;
        s.serialize_field("worker", &self.worker)?;
        match self.order {
            Some(order) => s.serialize_field("order", &order)?,
            None => s.skip_field("order")?,
        }
        match &self.node_id {
            Some(id) => s.serialize_field("node_id", id)?,
            None => s.skip_field("node_id")?,
        }
        if self.node_id.is_some() {
            s.serialize_field("depends_on", &self.depends_on)?;
        } else {
            s.skip_field("depends_on")?;
        }
        s.serialize_field("status", &self.status)?;
        s.serialize_field("input", &self.input)?;
        s.serialize_field("output", &self.output)?;
        s.serialize_field("error", &self.error)?;
        s.serialize_field("started_at", &self.started_at)?;
        s.serialize_field("completed_at", &self.completed_at)?;
        s.serialize_field("duration", &self.duration_secs())?;
        s.end()
    }
}

/// Step records of a run: ordered for chains, keyed by node id for DAGs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunSteps {
    Chain(Vec<StepRecord>),
    Dag(BTreeMap<String, StepRecord>),
}

impl RunSteps {
    pub fn iter(&self) -> Box<dyn Iterator<Item = &StepRecord> + '_> {
        match self {
            RunSteps::Chain(steps) => Box::new(steps.iter()),
            RunSteps::Dag(nodes) => Box::new(nodes.values()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RunSteps::Chain(steps) => steps.len(),
            RunSteps::Dag(nodes) => nodes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one chain or DAG execution.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub steps: RunSteps,
    /// Output of the last step that succeeded.
    #[serde(default)]
    pub final_output: Option<Context>,
    #[serde(default)]
    pub error: Option<String>,
    /// Set by `cancel_run`; the executor keeps going but the status sticks.
    #[serde(default)]
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunResult {
    /// A fresh chain run with one pending step per worker, in order.
    pub fn chain(run_id: RunId, workers: &[String]) -> Self {
        let steps = workers
            .iter()
            .enumerate()
            .map(|(i, w)| StepRecord::chain_step(w.clone(), i))
            .collect();
        Self::new(run_id, RunKind::Chain, RunSteps::Chain(steps))
    }

    /// A fresh DAG run with one pending record per node.
    pub fn dag(run_id: RunId, nodes: BTreeMap<String, StepRecord>) -> Self {
        Self::new(run_id, RunKind::Dag, RunSteps::Dag(nodes))
    }

    fn new(run_id: RunId, kind: RunKind, steps: RunSteps) -> Self {
        Self {
            run_id,
            kind,
            status: RunStatus::Running,
            steps,
            final_output: None,
            error: None,
            cancelled: false,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Chain step at `index`.
    pub fn chain_step(&self, index: usize) -> Option<&StepRecord> {
        match &self.steps {
            RunSteps::Chain(steps) => steps.get(index),
            RunSteps::Dag(_) => None,
        }
    }

    pub fn chain_step_mut(&mut self, index: usize) -> Option<&mut StepRecord> {
        match &mut self.steps {
            RunSteps::Chain(steps) => steps.get_mut(index),
            RunSteps::Dag(_) => None,
        }
    }

    /// DAG record for `node_id`.
    pub fn node(&self, node_id: &str) -> Option<&StepRecord> {
        match &self.steps {
            RunSteps::Dag(nodes) => nodes.get(node_id),
            RunSteps::Chain(_) => None,
        }
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut StepRecord> {
        match &mut self.steps {
            RunSteps::Dag(nodes) => nodes.get_mut(node_id),
            RunSteps::Chain(_) => None,
        }
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Seconds between start and completion, derived from the timestamps.
    pub fn total_duration_secs(&self) -> Option<f64> {
        duration_between(Some(self.started_at), self.completed_at)
    }

    /// Stamp completion and settle the final status.
    ///
    /// A cancelled run stays `failed` whatever its steps did.
    pub fn finish(&mut self, status: RunStatus) {
        self.completed_at = Some(Utc::now());
        if self.cancelled {
            self.status = RunStatus::Failed;
            return;
        }
        self.status = status;
        if status == RunStatus::Failed && self.count(StepStatus::Completed) == 0 {
            self.error = Some(self.first_error().unwrap_or_else(|| "No steps completed".into()));
        }
    }

    /// Mark the run cancelled (flag only).
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.status = RunStatus::Failed;
        self.error = Some("Run cancelled".into());
    }

    fn first_error(&self) -> Option<String> {
        self.steps.iter().find_map(|s| match s.status {
            StepStatus::Failed => s.error.clone(),
            _ => None,
        })
    }
}

impl Serialize for RunResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RunResult", 10)?;
        s.serialize_field("run_id", &self.run_id)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("status", &self.status)?;
        s.serialize_field("steps", &self.steps)?;
        s.serialize_field("final_output", &self.final_output)?;
        s.serialize_field("error", &self.error)?;
        s.serialize_field("cancelled", &self.cancelled)?;
        s.serialize_field("started_at", &self.started_at)?;
        s.serialize_field("completed_at", &self.completed_at)?;
        s.serialize_field("total_duration", &self.total_duration_secs())?;
        s.end()
    }
}

fn duration_between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    let (start, end) = (start?, end?);
    let micros = (end - start).num_microseconds().unwrap_or(0).max(0);
    Some(micros as f64 / 1_000_000.0)
}

/// Events emitted by the executors while a run progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A chain or DAG run started.
    RunStarted { run_id: RunId, kind: RunKind, steps: usize },
    /// A worker invocation started.
    StepStarted { run_id: RunId, step: String, worker: String },
    /// A worker invocation completed.
    StepCompleted { run_id: RunId, step: String, worker: String, duration_secs: f64 },
    /// A worker invocation failed.
    StepFailed { run_id: RunId, step: String, worker: String, error: String },
    /// A DAG node was not run.
    StepSkipped { run_id: RunId, step: String, reason: String },
    /// The run settled.
    RunFinished { run_id: RunId, status: RunStatus, duration_secs: f64 },
    /// `cancel_run` flagged the run.
    RunCancelled { run_id: RunId },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepSkipped { run_id, .. }
            | RunEvent::RunFinished { run_id, .. }
            | RunEvent::RunCancelled { run_id } => run_id,
        }
    }
}
