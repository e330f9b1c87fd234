//! Worker invocation adapter.
//!
//! Turns the heterogeneous calling conventions of workers into a single
//! `invoke(worker, name, context, timeout) -> mapping` call.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use momentaic_core::error::{MomentaicError, Result};
use momentaic_core::traits::Worker;
use momentaic_core::types::{
    Capability, Context, WorkerInput, WorkerOutput, TASK_DESCRIPTION_KEY, TASK_NAME_KEY,
};

/// Pick the first capability, in precedence order, that the worker exposes.
pub fn select_capability(worker: &dyn Worker) -> Option<Capability> {
    let exposed = worker.capabilities();
    Capability::PRECEDENCE
        .into_iter()
        .find(|c| exposed.contains(c))
}

/// Shape the accumulated context into the arguments a capability expects.
pub fn build_input(capability: Capability, context: &Context) -> WorkerInput {
    let task_name = text_field(context, TASK_NAME_KEY);
    let task_description = text_field(context, TASK_DESCRIPTION_KEY);

    let (message, context) = match capability {
        Capability::Process => {
            let message = match (task_name, task_description) {
                (Some(name), Some(desc)) => Some(format!("{}: {}", name, desc)),
                (name, desc) => name.or(desc),
            };
            (Some(message.unwrap_or_default()), without_task_keys(context))
        }
        Capability::Generate => {
            let topic = task_description.or(task_name).unwrap_or_default();
            (Some(topic), without_task_keys(context))
        }
        Capability::Analyze => (None, context.clone()),
        Capability::Execute => (Some(task_name.unwrap_or_default()), context.clone()),
        Capability::Route => {
            let query = task_description.or(task_name).unwrap_or_default();
            (Some(query), without_task_keys(context))
        }
    };

    WorkerInput {
        capability,
        message,
        context,
    }
}

/// Normalize any worker return value into a mapping tagged with the worker name.
pub fn normalize_output(output: WorkerOutput, name: &str) -> Context {
    let mut map = match output {
        WorkerOutput::Map(map) => map,
        WorkerOutput::Text(text) => {
            let mut map = Context::new();
            map.insert("response".into(), Value::String(text));
            map
        }
        WorkerOutput::Value(value) => {
            let mut map = Context::new();
            map.insert("output".into(), Value::String(value.to_string()));
            map
        }
    };
    map.insert("worker".into(), Value::String(name.to_string()));
    map
}

/// Diagnostic mapping for a worker that exposes no known capability.
fn capability_mismatch(name: &str) -> Context {
    let mut map = Context::new();
    map.insert("worker".into(), Value::String(name.to_string()));
    map.insert(
        "error".into(),
        Value::String(format!("Worker '{}' exposes no supported capability", name)),
    );
    map.insert("capabilities".into(), Value::Array(vec![]));
    map
}

/// The limit for one call: `timeout`, shortened by the worker's own limit.
///
/// A worker limit that is negative, NaN or too large for a `Duration` is
/// ignored.
pub fn effective_timeout(worker: &dyn Worker, timeout: Duration) -> Duration {
    worker
        .timeout_secs()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map_or(timeout, |own| own.min(timeout))
}

/// Invoke a resolved worker with the current context.
pub async fn invoke(
    worker: &dyn Worker,
    name: &str,
    context: &Context,
    timeout: Duration,
) -> Result<Context> {
    let Some(capability) = select_capability(worker) else {
        return Ok(capability_mismatch(name));
    };

    let timeout = effective_timeout(worker, timeout);

    debug!(worker = %name, %capability, timeout_secs = timeout.as_secs_f64(), "Invoking worker");

    let input = build_input(capability, context);
    match tokio::time::timeout(timeout, worker.call(input)).await {
        Ok(result) => result.map(|output| normalize_output(output, name)),
        Err(_) => Err(MomentaicError::WorkerTimeout {
            timeout_secs: timeout.as_secs_f64(),
        }),
    }
}

fn text_field(context: &Context, key: &str) -> Option<String> {
    match context.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn without_task_keys(context: &Context) -> Context {
    context
        .iter()
        .filter(|(k, _)| k.as_str() != TASK_NAME_KEY && k.as_str() != TASK_DESCRIPTION_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
