pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::engine::WorkflowEngine;
use crate::engine::types::WorkflowDef;
use crate::storage::{RunFilter, WorkflowStore, local::LocalFileStore};

use self::config::{EngineConfig, StorageBackend};

#[derive(Parser)]
#[command(name = "workflow-engine", version, about = "Multi-agent workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a workflow-engine.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

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

        /// State store directory
        #[arg(long, env = "STORE_DIR")]
        store_dir: Option<PathBuf>,

        /// Storage backend (local, cloud)
        #[arg(long, env = "BACKEND")]
        backend: Option<StorageBackend>,

        /// Maximum request body size in bytes
        #[arg(long, env = "MAX_BODY")]
        max_body: Option<usize>,
    },

    /// Manage workflow definitions
    Definitions {
        #[command(subcommand)]
        action: DefinitionsCommands,
    },

    /// Manage workflow runs
    Runs {
        #[command(subcommand)]
        action: RunsCommands,
    },
}

#[derive(Subcommand)]
pub enum DefinitionsCommands {
    /// List workflow definitions
    List {
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Create or update a workflow definition from a JSON/YAML file
    Create {
        /// Path to a file containing a serialized WorkflowDef
        file: PathBuf,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum RunsCommands {
    /// List workflow runs
    List {
        #[arg(long)]
        workflow_id: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
        #[arg(long, default_value = "table")]
        format: String,
    },
    /// Show a single run in full
    Get {
        run_id: String,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
    /// Start a new run from a workflow definition
    Create {
        #[arg(long)]
        workflow_id: String,
        #[arg(long)]
        task: String,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
    /// Pause a running run
    Pause {
        run_id: String,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
    /// Resume a paused or failed run
    Resume {
        run_id: String,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
    /// Cancel a run
    Cancel {
        run_id: String,
        #[arg(long, default_value = "data/store")]
        store_dir: PathBuf,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_dir,
            backend,
            max_body,
        } => {
            let host = host.or(config.host).unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(config.port).unwrap_or(3000);
            let store_dir = store_dir
                .or(config.store_dir.map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("data/store"));
            let backend = backend.or(config.backend).unwrap_or_default();
            let max_body = max_body.or(config.max_body).unwrap_or(1_048_576);

            crate::api::serve(&host, port, store_dir, backend, max_body).await
        }
        Commands::Definitions { action } => run_definitions(action).await,
        Commands::Runs { action } => run_runs(action).await,
    }
}

/// Load environment variables from a .env file.
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!("Warning: Failed to load dotenv file '{}': {}", path.display(), e);
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => eprintln!("Warning: Failed to parse .env file: {}", e),
        },
    }
}

async fn run_definitions(action: DefinitionsCommands) -> Result<()> {
    match action {
        DefinitionsCommands::List { store_dir, format } => {
            let store = LocalFileStore::new(store_dir);
            let defs = store.list_defs().await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&defs)?);
                return Ok(());
            }

            if defs.is_empty() {
                println!("No workflow definitions found.");
                return Ok(());
            }

            println!("{:<20} {:<30} {:<8}", "ID", "NAME", "STEPS");
            println!("{}", "-".repeat(60));
            for def in &defs {
                println!("{:<20} {:<30} {:<8}", def.id, def.name, def.steps.len());
            }
            println!("\nTotal: {} definition(s)", defs.len());
            Ok(())
        }
        DefinitionsCommands::Create { file, store_dir } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read definition file: {}", file.display()))?;
            let def: WorkflowDef = if file.extension().and_then(|e| e.to_str()) == Some("json") {
                serde_json::from_str(&contents)?
            } else {
                serde_yaml::from_str(&contents)?
            };

            let store = LocalFileStore::new(store_dir);
            store.save_def(&def).await?;
            println!("Saved definition '{}' ({})", def.name, def.id);
            Ok(())
        }
    }
}

async fn run_runs(action: RunsCommands) -> Result<()> {
    match action {
        RunsCommands::List {
            workflow_id,
            status,
            store_dir,
            format,
        } => {
            let store = LocalFileStore::new(store_dir);
            let status = status.as_deref().map(str::parse).transpose()?;
            let runs = store.list_runs(RunFilter { workflow_id, status }).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }

            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }

            println!(
                "{:<38} {:<20} {:<10} {:<24}",
                "RUN ID", "WORKFLOW", "STATUS", "UPDATED"
            );
            println!("{}", "-".repeat(96));
            for run in &runs {
                println!(
                    "{:<38} {:<20} {:<10} {:<24}",
                    run.id,
                    run.workflow_name,
                    run.status,
                    run.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("\nTotal: {} run(s)", runs.len());
            Ok(())
        }
        RunsCommands::Get { run_id, store_dir } => {
            let store = LocalFileStore::new(store_dir);
            let run = store
                .get_run(&run_id)
                .await?
                .with_context(|| format!("Run '{run_id}' not found"))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            Ok(())
        }
        RunsCommands::Create {
            workflow_id,
            task,
            store_dir,
        } => {
            let store = Arc::new(LocalFileStore::new(store_dir));
            let def = store
                .get_def(&workflow_id)
                .await?
                .with_context(|| format!("Workflow definition '{workflow_id}' not found"))?;

            let engine = WorkflowEngine::new(store);
            let run = engine.start_run(&def, task).await?;
            println!("Run ID: {}", run.id);
            println!("Run token: {}", run.run_token);
            println!("Status: {}", run.status);
            Ok(())
        }
        RunsCommands::Pause { run_id, store_dir } => {
            let store = Arc::new(LocalFileStore::new(store_dir));
            let engine = WorkflowEngine::new(store);
            let run = engine.pause_run(&run_id).await?;
            println!("Status: {}", run.status);
            Ok(())
        }
        RunsCommands::Resume { run_id, store_dir } => {
            let store = Arc::new(LocalFileStore::new(store_dir));
            let engine = WorkflowEngine::new(store);
            let run = engine.resume_run(&run_id).await?;
            println!("Status: {}", run.status);
            Ok(())
        }
        RunsCommands::Cancel { run_id, store_dir } => {
            let store = Arc::new(LocalFileStore::new(store_dir));
            let engine = WorkflowEngine::new(store);
            let run = engine.cancel_run(&run_id).await?;
            println!("Status: {}", run.status);
            Ok(())
        }
    }
}
