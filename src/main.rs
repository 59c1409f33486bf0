// ToolWarden - Main Entry Point
//
// CLI front-end for the mediated execution pipeline:
// - Tool catalog inspection
// - One-shot tool execution
// - History listing, search, and replay
// - Scheduled task management and the long-running scheduler

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use toolwarden::audit::{AuditEntry, AuditLogger, AuditStatus};
use toolwarden::config::Config;
use toolwarden::executor::Executor;
use toolwarden::gateway::{Identity, PipelineRunner, ToolGateway};
use toolwarden::history::HistoryStore;
use toolwarden::policy::{PermissionManager, PermissionRule};
use toolwarden::rate_limit::RateLimiter;
use toolwarden::registry::ToolRegistry;
use toolwarden::scheduler::{SystemClock, TaskPatch, TaskScheduler, TaskSpec};
use toolwarden::telemetry::LogTelemetry;
use toolwarden::validate::ArgumentMap;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// ToolWarden: mediated execution for security tooling
#[derive(Parser, Debug)]
#[command(name = "toolwarden")]
#[command(version = "0.1.0")]
#[command(about = "Validated, permissioned, audited execution of security tools", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the tool catalog
    List,
    /// Execute a tool through the pipeline
    Exec {
        /// Tool name
        tool: String,

        /// Arguments as key=value pairs
        #[arg(value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Identity the call runs under
        #[arg(long, default_value = "operator")]
        identity: String,

        /// Roles granted to the identity (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Show execution history
    History {
        /// Only entries owned by this identity
        #[arg(long)]
        identity: Option<String>,

        /// Substring to search for
        #[arg(long)]
        query: Option<String>,

        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Delete matching entries instead of listing them
        #[arg(long)]
        clear: bool,
    },
    /// Re-execute a past history entry
    Replay {
        /// History entry id
        id: String,

        /// Identity the replay runs under
        #[arg(long, default_value = "operator")]
        identity: String,

        /// Roles granted to the identity (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },
    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        action: TaskCommands,
    },
    /// Run the scheduler until interrupted
    Serve,
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// List scheduled tasks
    List,
    /// Create a scheduled task
    Add {
        /// Task name
        name: String,

        /// Cron expression (seconds-resolution)
        #[arg(long)]
        cron: String,

        /// Target tool name
        #[arg(long)]
        tool: String,

        /// Arguments as key=value pairs
        #[arg(long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Identity the task runs under
        #[arg(long, default_value = "scheduler")]
        identity: String,

        /// Roles granted to the identity (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,

        /// Create the task without starting its timer
        #[arg(long)]
        disabled: bool,
    },
    /// Enable a task
    Enable { id: String },
    /// Disable a task
    Disable { id: String },
    /// Delete a task
    Remove { id: String },
    /// Fire a task once, outside its schedule
    RunNow { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    let filter = if args.verbose {
        Level::DEBUG
    } else {
        config
            .logging
            .level
            .parse::<Level>()
            .unwrap_or(Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .init();

    match args.command {
        Commands::List => {
            let registry = ToolRegistry::builtin();
            let catalog = registry.list();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        Commands::Exec {
            tool,
            args: kv_args,
            identity,
            roles,
        } => {
            let gateway = build_gateway(&config)?;
            let arguments = parse_arguments(&kv_args)?;
            let caller = build_identity(&identity, &roles);

            let result = gateway.execute(&tool, arguments, &caller).await;
            gateway.history().flush_now();
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error {
                std::process::exit(1);
            }
        }
        Commands::History {
            identity,
            query,
            limit,
            clear,
        } => {
            let telemetry = Arc::new(LogTelemetry);
            let history = HistoryStore::open(
                &config.history,
                config.data_dir.join("history.json"),
                telemetry.clone(),
            );
            if clear {
                let removed = history.clear(identity.as_deref());
                history.flush_now();
                let audit = AuditLogger::new(config.audit.clone(), telemetry);
                audit
                    .log(
                        AuditEntry::new(
                            "history_cleared",
                            identity.as_deref().unwrap_or("all"),
                            "history",
                            AuditStatus::Success,
                        )
                        .with_metadata("removed", serde_json::json!(removed)),
                    )
                    .await;
                println!("cleared {removed} entries");
            } else {
                let entries = match query {
                    Some(q) => history.search(&q, identity.as_deref(), limit),
                    None => history.list(identity.as_deref(), limit, 0),
                };
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
        }
        Commands::Replay {
            id,
            identity,
            roles,
        } => {
            let gateway = build_gateway(&config)?;
            let caller = build_identity(&identity, &roles);
            let entry = gateway.replay(&id, &caller).await?;
            gateway.history().flush_now();
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Commands::Task { action } => {
            run_task_command(&config, action).await?;
        }
        Commands::Serve => {
            let gateway = Arc::new(build_gateway(&config)?);
            let _scheduler = open_scheduler(&config, gateway.clone())?;
            info!("scheduler running, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            gateway.history().flush_now();
            info!("shutting down");
        }
    }

    Ok(())
}

async fn run_task_command(config: &Config, action: TaskCommands) -> Result<()> {
    let gateway = Arc::new(build_gateway(config)?);
    let scheduler = open_scheduler(config, gateway.clone())?;

    match action {
        TaskCommands::List => {
            println!("{}", serde_json::to_string_pretty(&scheduler.list())?);
        }
        TaskCommands::Add {
            name,
            cron,
            tool,
            args,
            identity,
            roles,
            disabled,
        } => {
            let task = scheduler
                .create(TaskSpec {
                    name,
                    cron,
                    tool,
                    arguments: parse_arguments(&args)?,
                    enabled: !disabled,
                    identity,
                    roles,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Enable { id } => {
            let task = scheduler
                .update(
                    &id,
                    TaskPatch {
                        enabled: Some(true),
                        ..TaskPatch::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Disable { id } => {
            let task = scheduler
                .update(
                    &id,
                    TaskPatch {
                        enabled: Some(false),
                        ..TaskPatch::default()
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Remove { id } => {
            if scheduler.delete(&id).await {
                println!("deleted {id}");
            } else {
                anyhow::bail!("scheduled task '{id}' not found");
            }
        }
        TaskCommands::RunNow { id } => {
            let result = scheduler.run_now(&id).await?;
            gateway.history().flush_now();
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Wire the full pipeline from configuration.
fn build_gateway(config: &Config) -> Result<ToolGateway> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;

    let telemetry = Arc::new(LogTelemetry);
    let registry = Arc::new(ToolRegistry::builtin());
    let permissions = Arc::new(PermissionManager::new(default_rules()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
    let executor = Executor::new(config.executor.clone());
    let audit = AuditLogger::new(config.audit.clone(), telemetry.clone());
    let history = HistoryStore::open(
        &config.history,
        config.data_dir.join("history.json"),
        telemetry,
    );

    Ok(ToolGateway::new(
        registry,
        permissions,
        rate_limiter,
        executor,
        audit,
        history,
    ))
}

fn open_scheduler(config: &Config, runner: Arc<dyn PipelineRunner>) -> Result<TaskScheduler> {
    let audit = AuditLogger::new(config.audit.clone(), Arc::new(LogTelemetry));
    Ok(TaskScheduler::open(
        runner,
        audit,
        Arc::new(SystemClock),
        config.data_dir.join("tasks.json"),
    ))
}

/// Grant the catalog executables to any identity by default; operators
/// tighten this by editing the rules here or denying in front.
fn default_rules() -> Vec<PermissionRule> {
    ["nmap", "masscan", "nikto", "sqlmap", "gobuster", "hydra", "john"]
        .iter()
        .map(|cmd| PermissionRule::allow(cmd))
        .collect()
}

fn build_identity(id: &str, roles: &[String]) -> Identity {
    let refs: Vec<&str> = roles.iter().map(String::as_str).collect();
    Identity::new(id).with_roles(&refs)
}

/// Parse `key=value` pairs into an argument map. Values that parse as JSON
/// scalars keep their type; everything else is a string.
fn parse_arguments(pairs: &[String]) -> Result<ArgumentMap> {
    let mut map = ArgumentMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("argument '{pair}' is not in key=value form"))?;
        let parsed = match serde_json::from_str::<serde_json::Value>(value) {
            Ok(v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_))) => v,
            _ => serde_json::Value::String(value.to_string()),
        };
        map.insert(key.to_string(), parsed);
    }
    Ok(map)
}
