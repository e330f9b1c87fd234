use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use momentaic_core::types::RunResult;

/// Bounded table of recent runs, used for status polling.
///
/// When full, the oldest finished run is evicted first; if every tracked run
/// is still executing, the oldest run goes.
pub struct RunHistory {
    capacity: usize,
    inner: Mutex<HistoryInner>,
}

#[derive(Default)]
struct HistoryInner {
    runs: HashMap<String, RunResult>,
    /// Run ids in insertion order.
    order: VecDeque<String>,
}

impl RunHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    /// Start tracking a run.
    pub fn insert(&self, run: RunResult) {
        let mut inner = self.lock();
        let id = run.run_id.0.clone();
        if inner.runs.insert(id.clone(), run).is_none() {
            inner.order.push_back(id);
        }
        while inner.runs.len() > self.capacity {
            let victim = inner
                .order
                .iter()
                .position(|id| inner.runs.get(id).is_some_and(|r| r.status.is_finished()))
                .unwrap_or(0);
            if let Some(evicted) = inner.order.remove(victim) {
                inner.runs.remove(&evicted);
                debug!(run_id = %evicted, "Evicted run from history");
            }
        }
    }

    /// Store the executor's latest snapshot of `run`.
    ///
    /// A cancellation recorded here since the last sync is copied onto `run`
    /// so the executor's own copy reflects it too. Runs that were evicted
    /// are not re-added.
    pub fn sync(&self, run: &mut RunResult) {
        let mut inner = self.lock();
        if let Some(stored) = inner.runs.get_mut(run.run_id.as_str()) {
            if stored.cancelled && !run.cancelled {
                run.cancel();
            }
            *stored = run.clone();
        }
    }

    /// Snapshot of a tracked run.
    pub fn get(&self, run_id: &str) -> Option<RunResult> {
        self.lock().runs.get(run_id).cloned()
    }

    /// Flag a running run as cancelled. Returns false for unknown or finished runs.
    pub fn cancel(&self, run_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.runs.get_mut(run_id) {
            Some(run) if !run.status.is_finished() && !run.cancelled => {
                run.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use momentaic_core::types::{RunId, RunStatus};

    fn run(id: &str) -> RunResult {
        RunResult::chain(RunId::from_string(id), &["w".into()])
    }

    fn finished(id: &str) -> RunResult {
        let mut r = run(id);
        r.finish(RunStatus::Completed);
        r
    }

    #[test]
    fn test_insert_and_get() {
        let history = RunHistory::new(4);
        history.insert(run("a"));
        assert_eq!(history.get("a").unwrap().run_id.as_str(), "a");
        assert!(history.get("missing").is_none());
    }

    #[test]
    fn test_evicts_oldest_finished_first() {
        let history = RunHistory::new(2);
        history.insert(run("running"));
        history.insert(finished("done"));
        history.insert(run("new"));

        assert_eq!(history.len(), 2);
        assert!(history.get("running").is_some());
        assert!(history.get("done").is_none());
        assert!(history.get("new").is_some());
    }

    #[test]
    fn test_evicts_oldest_when_all_running() {
        let history = RunHistory::new(2);
        history.insert(run("a"));
        history.insert(run("b"));
        history.insert(run("c"));
        assert!(history.get("a").is_none());
        assert!(history.get("b").is_some());
        assert!(history.get("c").is_some());
    }

    #[test]
    fn test_cancel_only_running() {
        let history = RunHistory::new(4);
        history.insert(run("live"));
        history.insert(finished("done"));

        assert!(history.cancel("live"));
        assert!(!history.cancel("live"));
        assert!(!history.cancel("done"));
        assert!(!history.cancel("unknown"));

        let live = history.get("live").unwrap();
        assert!(live.cancelled);
        assert_eq!(live.status, RunStatus::Failed);
    }

    #[test]
    fn test_sync_carries_cancellation_back() {
        let history = RunHistory::new(4);
        let mut local = run("r");
        history.insert(local.clone());
        history.cancel("r");

        history.sync(&mut local);
        assert!(local.cancelled);
        assert_eq!(local.error.as_deref(), Some("Run cancelled"));
    }

    #[test]
    fn test_sync_ignores_evicted_runs() {
        let history = RunHistory::new(1);
        let mut first = run("first");
        history.insert(first.clone());
        history.insert(run("second"));
        history.sync(&mut first);
        assert!(history.get("first").is_none());
    }
}
