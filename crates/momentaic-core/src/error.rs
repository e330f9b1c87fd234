use thiserror::Error;

#[derive(Debug, Error)]
pub enum MomentaicError {
    // Worker errors
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Timeout after {timeout_secs}s")]
    WorkerTimeout { timeout_secs: f64 },

    /// Whatever the worker reported, kept verbatim.
    #[error("{0}")]
    WorkerRuntime(String),

    #[error("Worker registration failed: {name}: {message}")]
    WorkerRegistration { name: String, message: String },

    // Graph errors
    #[error("Dependency failed: {dependency}")]
    DependencyFailed { node: String, dependency: String },

    #[error("Graph contains a cycle through nodes: {}", nodes.join(", "))]
    CyclicGraph { nodes: Vec<String> },

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MomentaicError>;
