use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use momentaic_agent::{DagNode, RunLogger, RunOptions, TaskGraph, TaskGraphExecutor, WorkerRegistry};
use momentaic_core::event::EventBus;
use momentaic_core::types::{Context, RunEvent, RunStatus, StepStatus};
use momentaic_test_utils::{ctx, CallLog, FakeWorker};

fn executor(registry: WorkerRegistry) -> TaskGraphExecutor {
    TaskGraphExecutor::new(Arc::new(registry))
}

#[tokio::test]
async fn test_chain_visits_workers_in_order() {
    let log = CallLog::new();
    let mut registry = WorkerRegistry::new();
    for name in ["one", "two", "three", "four"] {
        registry.register(
            name,
            FakeWorker::replying(name, name)
                .with_delay(Duration::from_millis(5))
                .recording(&log),
        );
    }
    let exec = executor(registry);

    let run = exec
        .execute_chain(["four", "two", "one", "three"], Context::new(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(log.order(), vec!["four", "two", "one", "three"]);

    let steps: Vec<_> = run.steps.iter().collect();
    for pair in steps.windows(2) {
        assert!(pair[0].completed_at.unwrap() <= pair[1].started_at.unwrap());
    }
}

#[tokio::test]
async fn test_chain_accumulates_context() {
    let log = CallLog::new();
    let mut registry = WorkerRegistry::new();
    registry.register("a", FakeWorker::replying("a", json!({"a": 1})));
    registry.register("b", FakeWorker::replying("b", json!({"b": 2})));
    registry.register("probe", FakeWorker::replying("probe", "seen").recording(&log));
    let exec = executor(registry);

    let run = exec
        .execute_chain(
            ["a", "b", "probe"],
            ctx(json!({"startup": "acme", "a": 0})),
            RunOptions::default(),
        )
        .await;

    assert_eq!(run.status, RunStatus::Completed);
    let seen = log.get("probe").unwrap().input.context;
    assert_eq!(seen["a"], 1);
    assert_eq!(seen["b"], 2);
    assert_eq!(seen["startup"], "acme");
    assert_eq!(run.final_output.unwrap()["response"], "seen");
}

#[tokio::test]
async fn test_stop_on_error_leaves_rest_pending() {
    let mut registry = WorkerRegistry::new();
    registry.register("ok", FakeWorker::replying("ok", "fine"));
    registry.register("bad", FakeWorker::failing("bad", "model overloaded"));
    let exec = executor(registry);

    let run = exec
        .execute_chain(["ok", "bad", "ok"], Context::new(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.chain_step(0).unwrap().status, StepStatus::Completed);
    assert_eq!(run.chain_step(1).unwrap().status, StepStatus::Failed);
    assert_eq!(run.chain_step(1).unwrap().error.as_deref(), Some("model overloaded"));
    let third = run.chain_step(2).unwrap();
    assert_eq!(third.status, StepStatus::Pending);
    assert!(third.started_at.is_none());
    assert!(third.input.is_none());
    assert_eq!(run.final_output.unwrap()["response"], "fine");
}

#[tokio::test]
async fn test_all_failed_chain() {
    let mut registry = WorkerRegistry::new();
    registry.register("bad", FakeWorker::failing("bad", "boom"));
    let exec = executor(registry);

    let run = exec
        .execute_chain(
            ["bad", "bad"],
            Context::new(),
            RunOptions::default().with_stop_on_error(false),
        )
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.final_output.is_none());
    assert_eq!(run.count(StepStatus::Failed), 2);

    let value = serde_json::to_value(&run).unwrap();
    assert_eq!(value["status"], "failed");
    assert!(value["final_output"].is_null());
}

#[tokio::test]
async fn test_dag_fan_in() {
    let log = CallLog::new();
    let mut registry = WorkerRegistry::new();
    registry.register(
        "research",
        FakeWorker::replying("research", json!({"market": "b2b"}))
            .with_delay(Duration::from_millis(30))
            .recording(&log),
    );
    registry.register(
        "pricing",
        FakeWorker::replying("pricing", json!({"price": 49}))
            .with_delay(Duration::from_millis(10))
            .recording(&log),
    );
    registry.register(
        "pitch",
        FakeWorker::replying("pitch", json!({"deck": "ready"})).recording(&log),
    );
    let exec = executor(registry);

    let graph = TaskGraph::new()
        .node("A", DagNode::new("research"))
        .node("B", DagNode::new("pricing"))
        .node("C", DagNode::new("pitch").after(["A", "B"]));

    let run = exec
        .execute_dag(&graph, ctx(json!({"startup": "acme"})), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);

    let seen = log.get("pitch").unwrap().input.context;
    assert_eq!(seen["market"], "b2b");
    assert_eq!(seen["price"], 49);
    assert_eq!(seen["A_output"]["market"], "b2b");
    assert_eq!(seen["B_output"]["price"], 49);
    assert_eq!(seen["startup"], "acme");

    let a = run.node("A").unwrap();
    let b = run.node("B").unwrap();
    let c = run.node("C").unwrap();
    assert!(c.started_at.unwrap() >= a.completed_at.unwrap());
    assert!(c.started_at.unwrap() >= b.completed_at.unwrap());

    // The independent roots overlapped.
    let research = log.get("research").unwrap();
    let pricing = log.get("pricing").unwrap();
    assert!(pricing.started_at < research.finished_at);
}

#[tokio::test]
async fn test_dag_respects_concurrency_limit() {
    let log = CallLog::new();
    let mut registry = WorkerRegistry::new();
    registry.register(
        "slow",
        FakeWorker::replying("slow", "ok")
            .with_delay(Duration::from_millis(30))
            .recording(&log),
    );
    let exec = executor(registry).with_max_concurrency(2);

    let graph: TaskGraph = (0..6)
        .map(|i| (format!("n{}", i), DagNode::new("slow")))
        .collect();

    let run = exec
        .execute_dag(&graph, Context::new(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(log.calls().len(), 6);
    assert!(log.max_overlap() <= 2, "overlap was {}", log.max_overlap());
}

#[tokio::test]
async fn test_status_read_is_stable_after_completion() {
    let mut registry = WorkerRegistry::new();
    registry.register("ok", FakeWorker::replying("ok", "fine"));
    let exec = executor(registry);

    let run = exec
        .execute_chain(["ok"], Context::new(), RunOptions::default())
        .await;
    let first = exec.get_run_status(run.run_id.as_str()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = exec.get_run_status(run.run_id.as_str()).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, run);
    assert!(exec.get_run_status("no-such-run").is_none());
}

#[tokio::test]
async fn test_timeout_is_enforced() {
    let mut registry = WorkerRegistry::new();
    registry.register(
        "hang",
        FakeWorker::replying("hang", "late").with_delay(Duration::from_secs(30)),
    );
    let exec = executor(registry);

    let started = Instant::now();
    let run = exec
        .execute_chain(
            ["hang"],
            Context::new(),
            RunOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let step = run.chain_step(0).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("0.05"));
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_worker_timeout_override() {
    let mut registry = WorkerRegistry::new();
    registry.register(
        "quick",
        FakeWorker::replying("quick", "late")
            .with_delay(Duration::from_secs(30))
            .with_timeout_secs(0.05),
    );
    let exec = executor(registry);

    let run = exec
        .execute_chain(["quick"], Context::new(), RunOptions::default())
        .await;
    assert_eq!(
        run.chain_step(0).unwrap().error.as_deref(),
        Some("Timeout after 0.05s")
    );
}

#[tokio::test]
async fn test_worker_timeout_cannot_extend_run_timeout() {
    let mut registry = WorkerRegistry::new();
    registry.register(
        "patient",
        FakeWorker::replying("patient", "late")
            .with_delay(Duration::from_secs(30))
            .with_timeout_secs(3.0),
    );
    let exec = executor(registry);

    let started = Instant::now();
    let run = exec
        .execute_chain(
            ["patient"],
            Context::new(),
            RunOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert_eq!(
        run.chain_step(0).unwrap().error.as_deref(),
        Some("Timeout after 0.1s")
    );
}

#[tokio::test]
async fn test_unbounded_worker_timeout_uses_run_timeout() {
    let mut registry = WorkerRegistry::new();
    registry.register(
        "forever",
        FakeWorker::replying("forever", "late")
            .with_delay(Duration::from_secs(30))
            .with_timeout_secs(f64::INFINITY),
    );
    registry.register(
        "nan",
        FakeWorker::replying("nan", "fine").with_timeout_secs(f64::NAN),
    );
    let exec = executor(registry);

    let run = exec
        .execute_chain(
            ["nan", "forever"],
            Context::new(),
            RunOptions::default()
                .with_timeout(Duration::from_millis(50))
                .with_stop_on_error(false),
        )
        .await;

    assert_eq!(run.chain_step(0).unwrap().status, StepStatus::Completed);
    assert_eq!(
        run.chain_step(1).unwrap().error.as_deref(),
        Some("Timeout after 0.05s")
    );
    assert_eq!(run.status, RunStatus::Partial);
}

#[tokio::test]
async fn test_unknown_worker() {
    let exec = executor(WorkerRegistry::new());
    let run = exec
        .execute_chain(["ghost_worker"], Context::new(), RunOptions::default())
        .await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.steps.len(), 1);
    let step = run.chain_step(0).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_deref(), Some("Worker not found: ghost_worker"));
}

#[tokio::test]
async fn test_cancel_flags_running_chain() {
    let mut registry = WorkerRegistry::new();
    registry.register(
        "slow",
        FakeWorker::replying("slow", "done").with_delay(Duration::from_millis(100)),
    );
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let exec = Arc::new(executor(registry).with_event_bus(bus));

    let runner = exec.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_chain(["slow", "slow"], Context::new(), RunOptions::default())
            .await
    });

    let run_id = match rx.recv().await.unwrap() {
        RunEvent::RunStarted { run_id, .. } => run_id,
        other => panic!("expected RunStarted, got {:?}", other),
    };
    assert_eq!(
        exec.get_run_status(run_id.as_str()).unwrap().status,
        RunStatus::Running
    );
    assert!(exec.cancel_run(run_id.as_str()));

    let run = handle.await.unwrap();
    assert!(run.cancelled);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Run cancelled"));
    // Cancellation only flags the run; the in-flight step still finished.
    assert_eq!(run.chain_step(0).unwrap().status, StepStatus::Completed);
    assert!(!exec.cancel_run(run_id.as_str()));
}

#[tokio::test]
async fn test_cancel_flags_running_dag() {
    let log = CallLog::new();
    let mut registry = WorkerRegistry::new();
    registry.register(
        "slow",
        FakeWorker::replying("slow", "done")
            .with_delay(Duration::from_millis(100))
            .recording(&log),
    );
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let exec = Arc::new(executor(registry).with_event_bus(bus));

    let graph = TaskGraph::new()
        .node("A", DagNode::new("slow"))
        .node("B", DagNode::new("slow").after(["A"]))
        .node("C", DagNode::new("slow"));

    let runner = exec.clone();
    let handle = tokio::spawn(async move {
        runner
            .execute_dag(&graph, Context::new(), RunOptions::default())
            .await
            .unwrap()
    });

    let run_id = match rx.recv().await.unwrap() {
        RunEvent::RunStarted { run_id, .. } => run_id,
        other => panic!("expected RunStarted, got {:?}", other),
    };
    assert!(exec.cancel_run(run_id.as_str()));

    let run = handle.await.unwrap();
    assert!(run.cancelled);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Run cancelled"));
    // Nodes already running, and their dependents, still ran to completion.
    for id in ["A", "B", "C"] {
        assert_eq!(run.node(id).unwrap().status, StepStatus::Completed, "node {}", id);
    }
    assert_eq!(log.calls().len(), 3);

    let stored = exec.get_run_status(run_id.as_str()).unwrap();
    assert_eq!(stored, run);
    assert!(!exec.cancel_run(run_id.as_str()));
}

fn read_jsonl(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_run_log_records_dag_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = WorkerRegistry::new();
    registry.register("research", FakeWorker::replying("research", json!({"market": "b2b"})));
    registry.register("pitch", FakeWorker::replying("pitch", "deck"));
    let bus = Arc::new(EventBus::default());
    let exec = executor(registry).with_event_bus(bus.clone());

    let logger = RunLogger::new(dir.path().to_path_buf(), 3);
    let log_task = tokio::spawn(logger.run(bus, None, CancellationToken::new()));

    let graph = TaskGraph::new()
        .node("A", DagNode::new("research"))
        .node("B", DagNode::new("pitch").after(["A"]));
    let run = exec
        .execute_dag(&graph, Context::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let path = tokio::time::timeout(Duration::from_secs(5), log_task)
        .await
        .unwrap()
        .unwrap()
        .expect("log file written");
    assert!(path.starts_with(dir.path().join(run.run_id.as_str())));

    let lines = read_jsonl(&path);
    let kinds: Vec<&str> = lines
        .iter()
        .map(|l| l["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "step_started",
            "step_completed",
            "step_started",
            "step_completed",
            "run_finished",
        ]
    );
    assert_eq!(lines[0]["detail"]["kind"], "dag");
    assert_eq!(lines[1]["step"], "A");
    assert_eq!(lines[3]["step"], "B");
    assert_eq!(lines[5]["detail"]["status"], "completed");
    assert!(lines.iter().all(|l| l["run_id"] == run.run_id.as_str()));
}

#[tokio::test]
async fn test_run_log_records_chain_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = WorkerRegistry::new();
    registry.register("ok", FakeWorker::replying("ok", "fine"));
    registry.register("bad", FakeWorker::failing("bad", "model overloaded"));
    let bus = Arc::new(EventBus::default());
    let exec = executor(registry).with_event_bus(bus.clone());

    let logger = RunLogger::new(dir.path().to_path_buf(), 2);
    let log_task = tokio::spawn(logger.run(bus, None, CancellationToken::new()));

    let run = exec
        .execute_chain(["ok", "bad", "ok"], Context::new(), RunOptions::default())
        .await;
    assert_eq!(run.status, RunStatus::Partial);

    let path = tokio::time::timeout(Duration::from_secs(5), log_task)
        .await
        .unwrap()
        .unwrap()
        .expect("log file written");
    let lines = read_jsonl(&path);
    let kinds: Vec<&str> = lines
        .iter()
        .map(|l| l["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["run_started", "step_completed", "step_failed", "run_finished"]
    );
    assert_eq!(lines[2]["detail"]["worker"], "bad");
    assert_eq!(lines[2]["detail"]["error"], "model overloaded");
    assert_eq!(lines[3]["detail"]["status"], "partial");
}
