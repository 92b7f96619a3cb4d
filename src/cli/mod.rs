pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::engine::types::{HistoryEventKind, Task, Variables, variables_from_json};
use crate::engine::{HistoryFilter, ProcessEngine};
use crate::storage::StateStore;
use crate::storage::json_store::JsonStateStore;
use crate::storage::memory_store::MemoryStateStore;
pub use config::{IronBpmConfig, StoreKind};

const DEFAULT_STORE_DIR: &str = "data/bpm";
const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "ironbpm", version, about = "Lightweight BPM process engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a config file (default: auto-detect ironbpm.yaml in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State store directory (default: data/bpm)
    #[arg(long, global = true, env = "STORE_DIR")]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,

        /// State store backend
        #[arg(long, value_enum, env = "STORE")]
        store: Option<StoreKind>,

        /// Maximum request body size in bytes (default: 10 MB)
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,
    },

    /// Deploy a package (.zip, .bpmn or .bpmn20.xml)
    Deploy {
        /// Path to the package file
        package: PathBuf,

        /// Deployment name (default: the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List deployed process definitions
    Definitions {
        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Start a process instance
    Start {
        /// Process key (latest version) or full definition id
        process: String,

        /// Variables as a JSON object
        #[arg(long)]
        vars: Option<String>,

        /// User starting the instance (default: the `username` variable)
        #[arg(long)]
        initiator: Option<String>,
    },

    /// List open tasks
    Tasks {
        /// Only tasks assigned to this user
        #[arg(long)]
        assignee: Option<String>,

        /// Only unassigned tasks this user may claim
        #[arg(long)]
        candidate: Option<String>,

        /// Only tasks of this instance (includes finished tasks)
        #[arg(long)]
        instance: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Claim a task as a candidate user
    Claim {
        task_id: String,
        user: String,
    },

    /// Complete a task
    Complete {
        task_id: String,

        /// Variables as a JSON object
        #[arg(long)]
        vars: Option<String>,
    },

    /// Show history events
    History {
        /// Only events of this instance
        #[arg(long)]
        instance: Option<String>,

        /// Only events of this task
        #[arg(long)]
        task: Option<String>,

        /// Only events of this kind (started, activity_entered, ...)
        #[arg(long)]
        kind: Option<String>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = IronBpmConfig::load(cli.config.as_deref())?;
    let store_dir = cli
        .store_dir
        .or_else(|| config.store_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));

    match cli.command {
        Commands::Serve {
            host,
            port,
            store,
            max_body,
        } => {
            let host = host
                .or_else(|| config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(config.port).unwrap_or(3000);
            let max_body = max_body.or(config.max_body).unwrap_or(DEFAULT_MAX_BODY);
            let kind = store.or(config.store).unwrap_or_default();

            let store: Arc<dyn StateStore> = match kind {
                StoreKind::Json => Arc::new(JsonStateStore::new(&store_dir)),
                StoreKind::Memory => Arc::new(MemoryStateStore::new()),
            };
            info!(store = ?kind, store_dir = %store_dir.display(), "Opening state store");
            let engine = open_engine(store, &config).await?;
            crate::api::serve(&host, port, Arc::new(engine), max_body).await
        }
        Commands::Deploy { package, name } => cmd_deploy(&store_dir, &config, package, name).await,
        Commands::Definitions { format } => cmd_definitions(&store_dir, &config, &format).await,
        Commands::Start {
            process,
            vars,
            initiator,
        } => cmd_start(&store_dir, &config, &process, vars, initiator).await,
        Commands::Tasks {
            assignee,
            candidate,
            instance,
            format,
        } => cmd_tasks(&store_dir, &config, assignee, candidate, instance, &format).await,
        Commands::Claim { task_id, user } => cmd_claim(&store_dir, &config, &task_id, &user).await,
        Commands::Complete { task_id, vars } => cmd_complete(&store_dir, &config, &task_id, vars).await,
        Commands::History {
            instance,
            task,
            kind,
            format,
        } => cmd_history(&store_dir, &config, instance, task, kind, &format).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_engine(store: Arc<dyn StateStore>, config: &IronBpmConfig) -> Result<ProcessEngine> {
    let mut builder = ProcessEngine::builder(store);
    if let Some(steps) = config.max_auto_steps {
        builder = builder.max_auto_steps(steps);
    }
    Ok(builder.open().await?)
}

async fn open_local(store_dir: &Path, config: &IronBpmConfig) -> Result<ProcessEngine> {
    open_engine(Arc::new(JsonStateStore::new(store_dir)), config).await
}

fn parse_vars(json: Option<String>) -> Result<Variables> {
    let Some(json) = json else {
        return Ok(Variables::new());
    };
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&json).with_context(|| "Failed to parse --vars JSON object")?;
    Ok(variables_from_json(map)?)
}

async fn cmd_deploy(
    store_dir: &Path,
    config: &IronBpmConfig,
    package: PathBuf,
    name: Option<String>,
) -> Result<()> {
    let bytes = tokio::fs::read(&package)
        .await
        .with_context(|| format!("Failed to read package: {}", package.display()))?;
    let name = name.unwrap_or_else(|| {
        package
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    let engine = open_local(store_dir, config).await?;
    let deployment = engine.deploy_package(&bytes, &name).await?;

    println!("Deployment: {} ({})", deployment.name, deployment.id);
    for id in &deployment.definition_ids {
        println!("  definition {}", id);
    }
    Ok(())
}

async fn cmd_definitions(store_dir: &Path, config: &IronBpmConfig, format: &str) -> Result<()> {
    let engine = open_local(store_dir, config).await?;
    let defs = engine.definitions().await;

    if defs.is_empty() {
        println!("No definitions deployed.");
        return Ok(());
    }
    if format == "json" {
        let defs: Vec<_> = defs.iter().map(|d| d.as_ref()).collect();
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    println!("{:<20} {:<8} {:<30} ID", "KEY", "VERSION", "NAME");
    println!("{}", "-".repeat(100));
    for def in &defs {
        println!("{:<20} {:<8} {:<30} {}", def.key, def.version, def.name, def.id);
    }
    println!("\nTotal: {} definition(s)", defs.len());
    Ok(())
}

async fn cmd_start(
    store_dir: &Path,
    config: &IronBpmConfig,
    process: &str,
    vars: Option<String>,
    initiator: Option<String>,
) -> Result<()> {
    let vars = parse_vars(vars)?;
    let initiator = initiator.or_else(|| vars.get("username").map(|v| v.to_text()));
    let engine = open_local(store_dir, config).await?;

    // Definition ids are `key:version:uuid`; anything else is a key.
    let instance = if process.contains(':') {
        engine
            .start_instance(process, vars, initiator.as_deref())
            .await?
    } else {
        engine
            .start_instance_by_key(process, vars, initiator.as_deref())
            .await?
    };

    println!("Instance: {}", instance.id);
    println!("Status: {}", instance.status);
    print_tasks(&engine.tasks_for_instance(&instance.id).await, "table")?;
    Ok(())
}

async fn cmd_tasks(
    store_dir: &Path,
    config: &IronBpmConfig,
    assignee: Option<String>,
    candidate: Option<String>,
    instance: Option<String>,
    format: &str,
) -> Result<()> {
    let engine = open_local(store_dir, config).await?;
    let tasks = match (assignee, candidate, instance) {
        (Some(user), _, _) => engine.tasks_by_assignee(&user).await,
        (None, Some(user), _) => engine.tasks_by_candidate(&user).await,
        (None, None, Some(id)) => engine.tasks_for_instance(&id).await,
        (None, None, None) => engine
            .list_tasks()
            .await
            .into_iter()
            .filter(|t| t.status.is_open())
            .collect(),
    };
    print_tasks(&tasks, format)
}

async fn cmd_claim(store_dir: &Path, config: &IronBpmConfig, task_id: &str, user: &str) -> Result<()> {
    let engine = open_local(store_dir, config).await?;
    let task = engine.claim(task_id, user).await?;
    println!("Task {} claimed by {}", task.id, user);
    Ok(())
}

async fn cmd_complete(
    store_dir: &Path,
    config: &IronBpmConfig,
    task_id: &str,
    vars: Option<String>,
) -> Result<()> {
    let vars = parse_vars(vars)?;
    let engine = open_local(store_dir, config).await?;
    let instance = engine.complete(task_id, vars).await?;

    println!("Task {} completed", task_id);
    println!("Instance {}: {}", instance.id, instance.status);
    let open: Vec<Task> = engine
        .tasks_for_instance(&instance.id)
        .await
        .into_iter()
        .filter(|t| t.status.is_open())
        .collect();
    print_tasks(&open, "table")
}

async fn cmd_history(
    store_dir: &Path,
    config: &IronBpmConfig,
    instance: Option<String>,
    task: Option<String>,
    kind: Option<String>,
    format: &str,
) -> Result<()> {
    let kind = kind
        .as_deref()
        .map(str::parse::<HistoryEventKind>)
        .transpose()
        .map_err(|e| anyhow::anyhow!(e))?;
    let filter = HistoryFilter {
        instance_id: instance,
        task_id: task,
        kind,
    };

    let engine = open_local(store_dir, config).await?;
    let events = engine.history(&filter).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }
    println!("{:<6} {:<20} {:<18} {:<20} ACTOR", "SEQ", "TIME", "KIND", "NODE");
    println!("{}", "-".repeat(80));
    for e in &events {
        println!(
            "{:<6} {:<20} {:<18} {:<20} {}",
            e.seq,
            e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            e.kind.to_string(),
            e.node_id.as_deref().unwrap_or("-"),
            e.actor.as_deref().unwrap_or("-")
        );
    }
    println!("\nTotal: {} event(s)", events.len());
    Ok(())
}

fn print_tasks(tasks: &[Task], format: &str) -> Result<()> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!("{:<38} {:<20} {:<10} {:<15} CANDIDATES", "TASK ID", "NAME", "STATUS", "ASSIGNEE");
    println!("{}", "-".repeat(100));
    for t in tasks {
        println!(
            "{:<38} {:<20} {:<10} {:<15} {}",
            t.id,
            t.name.as_deref().unwrap_or(&t.node_id),
            t.status.to_string(),
            t.assignee.as_deref().unwrap_or("-"),
            t.candidate_users.join(",")
        );
    }
    Ok(())
}
