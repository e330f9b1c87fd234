use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MomentaicError, Result};
use crate::types::Capability;

/// Top-level MomentAIc configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Runtime JSONL logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Command-backed workers, keyed by registry name.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerConfig>,
}

/// Defaults applied to every chain and DAG run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Abort the run on the first failed step (default: true).
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
    /// Timeout for a single worker invocation, in seconds (default: 300).
    #[serde(default = "default_timeout_per_step")]
    pub timeout_per_step_secs: f64,
    /// Maximum DAG nodes invoking workers at once (0 = unbounded).
    #[serde(default)]
    pub max_concurrency: usize,
    /// How many runs `get_run_status` can still answer for (default: 256).
    #[serde(default = "default_run_history_capacity")]
    pub run_history_capacity: usize,
    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_on_error: default_stop_on_error(),
            timeout_per_step_secs: default_timeout_per_step(),
            max_concurrency: 0,
            run_history_capacity: default_run_history_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ExecutorConfig {
    /// Per-step timeout; the default applies when the configured value is not
    /// a representable number of seconds.
    pub fn timeout_per_step(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_per_step_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_timeout_per_step()))
    }

    /// Concurrency limit, `None` when unbounded.
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }
}

fn default_stop_on_error() -> bool { true }
fn default_timeout_per_step() -> f64 { 300.0 }
fn default_run_history_capacity() -> usize { 256 }
fn default_event_capacity() -> usize { 256 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.momentaic/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-step results, 3 = everything (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolve_dir(&self) -> PathBuf {
        match self.log_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.momentaic/logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// A worker backed by a shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Command run via `sh -c`.
    pub command: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    /// Per-worker timeout override.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Working directory for the command.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Process]
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MomentaicError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| MomentaicError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the executor cannot work with.
    pub fn validate(&self) -> Result<()> {
        let timeout = self.executor.timeout_per_step_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            return Err(MomentaicError::Config(format!(
                "executor.timeout_per_step_secs must be positive, got {}",
                timeout
            )));
        }
        if self.executor.run_history_capacity == 0 {
            return Err(MomentaicError::Config(
                "executor.run_history_capacity must be at least 1".into(),
            ));
        }
        for (name, worker) in &self.workers {
            if worker.command.trim().is_empty() {
                return Err(MomentaicError::Config(format!(
                    "workers.{}.command is empty",
                    name
                )));
            }
            if let Some(t) = worker.timeout_secs {
                if !t.is_finite() || t <= 0.0 {
                    return Err(MomentaicError::Config(format!(
                        "workers.{}.timeout_secs must be positive, got {}",
                        name, t
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_MOMENTAIC_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_MOMENTAIC_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_MOMENTAIC_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_MOMENTAIC_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_MOMENTAIC_VAR}\"");
    }

    #[test]
    fn test_executor_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.executor.stop_on_error);
        assert_eq!(config.executor.timeout_per_step_secs, 300.0);
        assert_eq!(config.executor.concurrency_limit(), None);
        assert_eq!(config.executor.run_history_capacity, 256);
        assert!(config.log.is_none());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_worker_defaults() {
        let toml_str = r#"
[workers.echo]
command = "cat"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let echo = &config.workers["echo"];
        assert_eq!(echo.capabilities, vec![Capability::Process]);
        assert!(echo.timeout_secs.is_none());
        assert!(echo.env.is_empty());
    }

    #[test]
    fn test_concurrency_limit() {
        let mut exec = ExecutorConfig::default();
        exec.max_concurrency = 4;
        assert_eq!(exec.concurrency_limit(), Some(4));
    }

    #[test]
    fn test_unrepresentable_timeout_falls_back_to_default() {
        let mut exec = ExecutorConfig::default();
        exec.timeout_per_step_secs = f64::INFINITY;
        assert_eq!(exec.timeout_per_step(), Duration::from_secs(300));
        exec.timeout_per_step_secs = f64::NAN;
        assert_eq!(exec.timeout_per_step(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_bad_timeout() {
        let mut config = AppConfig::default();
        config.executor.timeout_per_step_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let toml_str = r#"
[workers.blank]
command = "  "
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("workers.blank.command"));
    }

    #[test]
    fn test_log_dir_resolution() {
        let log = LogConfig {
            log_dir: Some("/var/log/momentaic".into()),
            ..LogConfig::default()
        };
        assert_eq!(log.resolve_dir(), PathBuf::from("/var/log/momentaic"));
    }
}
