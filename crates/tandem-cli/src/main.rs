use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tandem_orchestrator::{
    default_config_path, load_tasks, AgentRegistry, DryRunExecutor, Orchestrator, RoundRecord,
    RunReport, ShellExecutor, ShellExecutorConfig, TandemConfig, TaskStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tandem", version, about = "Tandem: parallel multi-agent task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a task list with the shell executor
    Run {
        /// Task file (.md, .json or .toml)
        #[arg(short, long)]
        tasks: PathBuf,
        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,
        /// Command template (overrides [executor] command)
        #[arg(long)]
        exec: Option<String>,
        /// Per-task timeout in seconds (overrides [executor] timeout_secs)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Simulate a run and print the assignment of every round
    Plan {
        /// Task file (.md, .json or .toml)
        #[arg(short, long)]
        tasks: PathBuf,
    },
    /// Load and validate a task list without running anything
    Validate {
        /// Task file (.md, .json or .toml)
        #[arg(short, long)]
        tasks: PathBuf,
    },
    /// List the configured agents
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Run {
            tasks,
            report,
            exec,
            timeout_secs,
        } => {
            let executor = shell_executor(&config, exec, timeout_secs)?;
            let orchestrator = build(&config, &tasks, Arc::new(executor)).await?;
            let run = orchestrator.run().await?;
            print!("{}", render_report(&run));

            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&run)?;
                tokio::fs::write(&path, json)
                    .await
                    .with_context(|| format!("Failed to write report '{}'", path.display()))?;
                info!(path = %path.display(), "Run report written");
            }

            Ok(if run.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Plan { tasks } => {
            let orchestrator = build(&config, &tasks, Arc::new(DryRunExecutor)).await?;
            let run = orchestrator.run().await?;
            print!("{}", render_plan(&orchestrator.history().await));
            println!("{}", run.summary);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { tasks } => {
            println!("{}", validate(&config, &tasks).await?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Agents => {
            print!("{}", render_agents(&config));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Missing config file is fine: built-in agents, no executor.
async fn load_config(path: &Path) -> anyhow::Result<TandemConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TandemConfig::default());
    }
    TandemConfig::load(path)
        .await
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

fn shell_executor(
    config: &TandemConfig,
    exec: Option<String>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<ShellExecutor> {
    let mut settings = match (exec, config.executor.clone()) {
        (Some(command), Some(configured)) => ShellExecutorConfig {
            command,
            ..configured
        },
        (Some(command), None) => ShellExecutorConfig {
            project_root: Some(PathBuf::from(".")),
            ..ShellExecutorConfig::new(command)
        },
        (None, Some(configured)) => configured,
        (None, None) => bail!(
            "No executor command configured: set [executor] command in the config file or pass --exec"
        ),
    };
    if let Some(secs) = timeout_secs {
        settings.timeout_secs = Some(secs.max(1));
    }
    Ok(ShellExecutor::from_config(settings))
}

async fn build(
    config: &TandemConfig,
    tasks: &Path,
    executor: Arc<dyn tandem_orchestrator::WorkExecutor>,
) -> anyhow::Result<Orchestrator> {
    let specs = load_tasks(tasks)
        .await
        .with_context(|| format!("Failed to load tasks from '{}'", tasks.display()))?;
    info!(count = specs.len(), path = %tasks.display(), "Tasks loaded");
    Ok(Orchestrator::new(specs, config.agent_specs(), executor)?.with_policy(config.scheduling))
}

async fn validate(config: &TandemConfig, tasks: &Path) -> anyhow::Result<String> {
    let specs = load_tasks(tasks).await?;
    let store = TaskStore::from_specs(specs)?;
    let registry = AgentRegistry::new(config.agent_specs())?;
    if registry.is_empty() && store.total_count() > 0 {
        bail!("No agents configured for {} task(s)", store.total_count());
    }

    let mut out = format!(
        "{}: {} task(s), {} agent(s), dependency graph OK",
        tasks.display(),
        store.total_count(),
        registry.len()
    );
    for task in store.all_tasks() {
        let matched = registry
            .agents()
            .iter()
            .any(|agent| tandem_orchestrator::score(agent, task) > 0);
        if !matched {
            let _ = write!(out, "\n  warning: no agent keyword matches {}", task.id);
        }
    }
    Ok(out)
}

fn render_plan(history: &[RoundRecord]) -> String {
    let mut out = String::new();
    for record in history {
        let _ = writeln!(out, "Round {}:", record.round);
        for assignment in &record.assignments {
            let _ = writeln!(
                out,
                "  {} -> {} (score {})",
                assignment.task_id, assignment.agent_id, assignment.score
            );
        }
    }
    out
}

fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    for task in &report.tasks {
        let _ = write!(out, "{:<10} {:<12}", task.id, task.status.to_string());
        if let Some(agent) = &task.executed_by {
            let _ = write!(out, " by {agent}");
        }
        if let Some(failure) = &task.failure {
            let _ = write!(out, ": {failure}");
        }
        if let Some(reason) = &task.blocked_reason {
            let _ = write!(out, ": {reason}");
        }
        out.push('\n');
    }
    let _ = writeln!(out, "{}", report.summary);
    out
}

fn render_agents(config: &TandemConfig) -> String {
    let specs = config.agent_specs();
    let mut out = String::new();
    if config.agents.is_empty() {
        out.push_str("Using built-in agents (no [[agents]] in config):\n");
    }
    for spec in &specs {
        let _ = write!(out, "  {} ({}): {}", spec.id, spec.name, spec.keywords.join(", "));
        if let Some(dir) = &spec.working_dir {
            let _ = write!(out, " [{}]", dir.display());
        }
        out.push('\n');
    }
    let _ = writeln!(out, "\nTotal: {} agent(s)", specs.len());
    out
}
