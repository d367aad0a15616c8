// ABOUTME: Operator CLI for a taskmux task root: drive task lifecycles, inspect
// ABOUTME: locks, and query the operation log. Every command prints JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use taskmux::prelude::*;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinate agent tasks stored on disk
#[derive(Parser)]
#[command(name = "taskmux")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// JSON config file (environment variables still override it)
    #[arg(short, long, global = true, env = "TASKMUX_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List an agent's tasks
    Tasks { agent: String },

    /// Create a task with an INIT.md
    Create {
        agent: String,
        task: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        objective: String,
        /// Repeat for each requirement
        #[arg(long = "requirement")]
        requirements: Vec<String>,
    },

    /// Start a task and make it the agent's current task
    Start { agent: String, task: String },

    /// Show a task's context (omit the task for the placeholder context)
    Context { agent: String, task: Option<String> },

    /// Show the agent's current task selection
    Current { agent: String },

    /// Submit PLAN.md from a file
    Plan {
        agent: String,
        file: PathBuf,
        #[arg(long)]
        task: Option<String>,
    },

    /// Update one plan step
    Progress {
        agent: String,
        step: usize,
        /// pending, in_progress, complete, or blocked
        status: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        task: Option<String>,
    },

    /// Finish a task with DONE or ERROR
    Complete {
        agent: String,
        status: String,
        summary: String,
        #[arg(long)]
        task: Option<String>,
    },

    /// Inspect and reclaim task locks
    Locks {
        #[command(subcommand)]
        command: LockCommand,
    },

    /// Query and maintain the operation log
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

#[derive(Subcommand)]
enum LockCommand {
    /// Show the lock state of one task
    Check { agent: String, task: String },

    /// Remove stale locks anywhere under the task root
    Cleanup,
}

#[derive(Subcommand)]
enum LogCommand {
    /// Replay log entries
    Entries {
        #[arg(long)]
        operation: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        task: Option<String>,
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        success: Option<bool>,
    },

    /// Aggregate statistics by operation and agent
    Stats,

    /// Move entries older than DAYS into an archive file
    Archive { days: u32 },

    /// Size, entry count, and time span of the log
    Info,

    /// Delete the live log
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = load_config(cli.config.as_deref())?;
    debug!(root = %config.task_root.display(), log = %config.log_file.display(), "loaded config");
    let engine = TaskContextManager::from_config(&config);

    let output = run(&engine, &config, cli.command).await;

    if let Err(e) = engine.logger().wait_for_write_queue_empty(DRAIN_TIMEOUT).await {
        tracing::warn!(error = %e, "operation log did not drain");
    }
    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

async fn run(
    engine: &TaskContextManager,
    config: &EngineConfig,
    command: Commands,
) -> Result<serde_json::Value> {
    match command {
        Commands::Tasks { agent } => {
            let conn = connect(engine, &agent, None).await;
            json(engine.check_assigned_tasks(&conn).await?)
        }
        Commands::Create {
            agent,
            task,
            title,
            objective,
            requirements,
        } => {
            let conn = connect(engine, &agent, None).await;
            let init = TaskInit {
                title,
                objective,
                requirements,
            };
            json(engine.create_task(&task, init, &conn).await?)
        }
        Commands::Start { agent, task } => {
            let conn = connect(engine, &agent, None).await;
            json(engine.start_task(&task, &conn).await?)
        }
        Commands::Context { agent, task } => {
            let conn = connect(engine, &agent, None).await;
            json(
                engine
                    .get_task_context(task.as_deref().unwrap_or(""), &conn)
                    .await?,
            )
        }
        Commands::Current { agent } => {
            let conn = connect(engine, &agent, None).await;
            json(engine.get_current_task(&conn).await?)
        }
        Commands::Plan { agent, file, task } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read plan {}", file.display()))?;
            let conn = connect(engine, &agent, task).await;
            json(engine.submit_plan(&content, &conn).await?)
        }
        Commands::Progress {
            agent,
            step,
            status,
            description,
            task,
        } => {
            let update = ProgressUpdate::new(step, status.parse()?, description);
            let conn = connect(engine, &agent, task).await;
            json(engine.report_progress(&[update], &conn).await?)
        }
        Commands::Complete {
            agent,
            status,
            summary,
            task,
        } => {
            let conn = connect(engine, &agent, task).await;
            json(engine.mark_complete(&status, &summary, &conn).await?)
        }
        Commands::Locks { command } => match command {
            LockCommand::Check { agent, task } => {
                let dir = engine.store().task_dir(&agent, &task)?;
                json(engine.locks().check_lock(&dir).await?)
            }
            LockCommand::Cleanup => {
                let removed = engine.locks().cleanup_stale_locks(&config.task_root).await?;
                json(removed)
            }
        },
        Commands::Log { command } => {
            let logger = engine.logger();
            match command {
                LogCommand::Entries {
                    operation,
                    agent,
                    task,
                    since,
                    success,
                } => {
                    let mut filter = LogFilter::new();
                    if let Some(operation) = operation {
                        filter = filter.operation(operation);
                    }
                    if let Some(agent) = agent {
                        filter = filter.agent(agent);
                    }
                    if let Some(task) = task {
                        filter = filter.task_id(task);
                    }
                    if let Some(since) = since {
                        filter = filter.since(since);
                    }
                    if let Some(success) = success {
                        filter = filter.success(success);
                    }
                    json(logger.get_log_entries(&filter).await?)
                }
                LogCommand::Stats => json(logger.get_operation_statistics().await?),
                LogCommand::Archive { days } => json(logger.archive_old_entries(days).await?),
                LogCommand::Info => json(logger.get_log_info().await?),
                LogCommand::Clear => {
                    logger.clear_logs().await?;
                    Ok(serde_json::json!({ "cleared": true }))
                }
            }
        }
    }
}

/// Register a one-shot connection for `agent`, optionally pinned to a task.
async fn connect(engine: &TaskContextManager, agent: &str, task: Option<String>) -> String {
    let id = format!("cli-{}", std::process::id());
    let mut connection = Connection::new(&id, agent).with_metadata("client", "taskmux-cli");
    if let Some(task) = task {
        connection = connection.with_metadata("taskId", task);
    }
    engine.connections().register(connection).await;
    id
}

fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
            .apply_env(|key| std::env::var(key).ok())?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

fn json<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Initialize tracing subscriber for diagnostics on stderr
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}
