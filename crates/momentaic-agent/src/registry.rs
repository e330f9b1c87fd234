use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use momentaic_core::config::WorkerConfig;
use momentaic_core::error::{MomentaicError, Result};
use momentaic_core::traits::Worker;
use momentaic_core::types::{Capability, WorkerInput, WorkerOutput};

use crate::workers::{CommandWorker, FnWorker};

type WorkerFactory = Box<dyn Fn() -> Result<Arc<dyn Worker>> + Send + Sync>;

/// Registry of available workers.
///
/// Workers can be registered ready-made or as factories. A factory runs the
/// first time its name is resolved and the instance is cached from then on.
/// Build the registry once at startup and share it behind an `Arc`.
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
    resolved: RwLock<HashMap<String, Arc<dyn Worker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Register a ready-made worker.
    pub fn register(&mut self, name: impl Into<String>, worker: impl Worker) {
        let name = name.into();
        self.factories.remove(&name);
        self.resolved_mut().insert(name, Arc::new(worker));
    }

    /// Register a worker that is built on first use.
    pub fn register_lazy<F, W>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<W> + Send + Sync + 'static,
        W: Worker,
    {
        let name = name.into();
        self.resolved_mut().remove(&name);
        self.factories.insert(
            name,
            Box::new(move || factory().map(|w| Arc::new(w) as Arc<dyn Worker>)),
        );
    }

    /// Register an async closure as a worker.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, capabilities: Vec<Capability>, f: F)
    where
        F: Fn(WorkerInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkerOutput>> + Send + 'static,
    {
        self.register(name, FnWorker::new(capabilities, f));
    }

    /// Unregister a worker by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        let had_factory = self.factories.remove(name).is_some();
        let had_instance = self.resolved_mut().remove(name).is_some();
        had_factory || had_instance
    }

    /// Resolve a worker by name, instantiating it on first use.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Worker>> {
        if let Some(worker) = self.read_resolved().get(name) {
            return Ok(worker.clone());
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| MomentaicError::WorkerNotFound(name.to_string()))?;

        let worker = factory().map_err(|e| MomentaicError::WorkerRegistration {
            name: name.to_string(),
            message: e.to_string(),
        })?;
        debug!(worker = %name, "Worker instantiated");

        // Another caller may have won the race; keep whichever landed first.
        let mut resolved = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
        Ok(resolved.entry(name.to_string()).or_insert(worker).clone())
    }

    /// Whether a worker is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name) || self.read_resolved().contains_key(name)
    }

    /// Names of all registered workers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .keys()
            .cloned()
            .chain(self.read_resolved().keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a registry with one command worker per config entry.
    pub fn from_config<'a>(workers: impl IntoIterator<Item = (&'a String, &'a WorkerConfig)>) -> Self {
        let mut registry = Self::new();
        for (name, config) in workers {
            let worker_name = name.clone();
            let config = config.clone();
            registry.register_lazy(name.clone(), move || {
                Ok(CommandWorker::new(worker_name.clone(), config.clone()))
            });
        }
        registry
    }

    fn read_resolved(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn Worker>>> {
        self.resolved.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolved_mut(&mut self) -> &mut HashMap<String, Arc<dyn Worker>> {
        self.resolved.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
