use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use momentaic_agent::{RunLogger, RunOptions, TaskGraph, TaskGraphExecutor, WorkerRegistry};
use momentaic_core::config::AppConfig;
use momentaic_core::event::EventBus;
use momentaic_core::types::{Context, RunResult, RunStatus};

#[derive(Parser)]
#[command(name = "momentaic", version, about = "Run chains and DAGs of agent workers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "momentaic.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers one after another, threading the context
    Chain {
        /// Worker names, in order
        #[arg(required = true)]
        workers: Vec<String>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run a dependency graph of workers from a JSON file
    Dag {
        /// Graph file: {"node": {"worker": "...", "depends_on": ["..."]}}
        graph: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// List configured workers
    Workers,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Initial context as a JSON object
    #[arg(long, default_value = "{}")]
    context: String,
    /// Keep going after a failed step
    #[arg(long)]
    continue_on_error: bool,
    /// Per-step timeout in seconds (overrides config)
    #[arg(long)]
    timeout: Option<f64>,
}

impl RunArgs {
    fn options(&self, defaults: RunOptions) -> anyhow::Result<RunOptions> {
        let mut options = defaults;
        if self.continue_on_error {
            options = options.with_stop_on_error(false);
        }
        if let Some(secs) = self.timeout {
            anyhow::ensure!(
                secs.is_finite() && secs > 0.0,
                "--timeout must be a positive number of seconds"
            );
            options = options.with_timeout(Duration::from_secs_f64(secs));
        }
        Ok(options)
    }

    fn initial_context(&self) -> anyhow::Result<Context> {
        match serde_json::from_str(&self.context).context("--context is not valid JSON")? {
            serde_json::Value::Object(map) => Ok(map),
            _ => anyhow::bail!("--context must be a JSON object"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("momentaic=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "momentaic", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Workers => {
            if config.workers.is_empty() {
                println!("No workers configured.");
            }
            for (name, worker) in &config.workers {
                let caps: Vec<&str> = worker.capabilities.iter().map(|c| c.as_str()).collect();
                println!("{:<20} [{}]  {}", name, caps.join(", "), worker.command);
            }
        }
        Commands::Chain { workers, run } => {
            let (executor, bus) = build_executor(&config);
            let options = run.options(executor.default_options())?;
            let context = run.initial_context()?;
            let logger = spawn_logger(&config, &bus);

            let result = executor.execute_chain(workers, context, options).await;
            return finish(result, logger).await;
        }
        Commands::Dag { graph, run } => {
            let raw = std::fs::read_to_string(&graph)
                .with_context(|| format!("reading graph {}", graph.display()))?;
            let graph: TaskGraph = serde_json::from_str(&raw)
                .with_context(|| format!("parsing graph {}", graph.display()))?;

            let (executor, bus) = build_executor(&config);
            let options = run.options(executor.default_options())?;
            let context = run.initial_context()?;
            let logger = spawn_logger(&config, &bus);

            let result = executor.execute_dag(&graph, context, options).await?;
            return finish(result, logger).await;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, falling back to defaults when the default path is absent.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if path != Path::new("momentaic.toml") {
        anyhow::bail!("config file not found: {}", path.display());
    }
    warn!("No momentaic.toml found, using defaults with no workers");
    Ok(AppConfig::default())
}

fn build_executor(config: &AppConfig) -> (TaskGraphExecutor, Arc<EventBus>) {
    let registry = WorkerRegistry::from_config(&config.workers);
    info!(workers = registry.len(), "Worker registry ready");

    let bus = Arc::new(EventBus::new(config.executor.event_capacity));
    let executor =
        TaskGraphExecutor::from_config(Arc::new(registry), &config.executor).with_event_bus(bus.clone());
    (executor, bus)
}

/// Spawn a RunLogger for the next run if logging is enabled.
fn spawn_logger(
    config: &AppConfig,
    bus: &Arc<EventBus>,
) -> Option<(tokio::task::JoinHandle<Option<PathBuf>>, CancellationToken)> {
    let log_config = config.log.as_ref().filter(|l| l.enabled)?;
    let logger = RunLogger::new(log_config.resolve_dir(), log_config.level);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(logger.run(bus.clone(), None, cancel.clone()));
    info!("RunLogger started (level {})", log_config.level);
    Some((handle, cancel))
}

/// Print the result, wait for the log to flush, and exit non-zero on failure.
async fn finish(
    result: RunResult,
    logger: Option<(tokio::task::JoinHandle<Option<PathBuf>>, CancellationToken)>,
) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let Some((handle, cancel)) = logger {
        // The logger stops on its own at RunFinished; the timeout covers a lagged receiver.
        match tokio::time::timeout(Duration::from_secs(2), handle).await {
            Ok(Ok(Some(path))) => info!(path = %path.display(), "Run log written"),
            Ok(_) => {}
            Err(_) => cancel.cancel(),
        }
    }

    if result.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
