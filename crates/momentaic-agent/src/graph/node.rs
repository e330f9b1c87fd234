use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use momentaic_core::error::{MomentaicError, Result};

/// A node in a task graph: one worker invocation gated on its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    /// Registry name of the worker to invoke.
    pub worker: String,
    /// Node ids that must finish before this node starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl DagNode {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            depends_on: vec![],
        }
    }

    /// Set the dependencies.
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Node id → node. Deserializes from `{"id": {"worker": ..., "depends_on": [...]}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskGraph {
    nodes: BTreeMap<String, DagNode>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node (builder style).
    pub fn node(mut self, id: impl Into<String>, node: DagNode) -> Self {
        self.insert(id, node);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, node: DagNode) {
        self.nodes.insert(id.into(), node);
    }

    pub fn get(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> &BTreeMap<String, DagNode> {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check every dependency exists and the graph is acyclic.
    ///
    /// Returns a topological order (Kahn's algorithm, ties broken by node id).
    pub fn validate(&self) -> Result<Vec<String>> {
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(MomentaicError::UnknownDependency {
                        node: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, node) in &self.nodes {
            // A node listing the same dependency twice still waits on it once.
            let mut deps: Vec<&str> = node.depends_on.iter().map(String::as_str).collect();
            deps.sort_unstable();
            deps.dedup();
            in_degree.insert(id.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(id.as_str());
            }
        }

        let mut ready: VecDeque<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(*child);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let mut stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            stuck.sort();
            return Err(MomentaicError::CyclicGraph { nodes: stuck });
        }

        Ok(order)
    }
}

impl FromIterator<(String, DagNode)> for TaskGraph {
    fn from_iter<T: IntoIterator<Item = (String, DagNode)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
