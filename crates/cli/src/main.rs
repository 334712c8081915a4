//! Waypoint CLI
//!
//! Inspection surface over a Waypoint runtime directory: run summaries,
//! checkpoints and the effective kernel configuration.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use waypoint_core::config::CONFIG_FILE;
use waypoint_core::graph::CheckpointStore;
use waypoint_core::storage::{KernelDb, RunSummaryStore, SqliteCheckpointStore, RUNTIME_PATH_ENV};
use waypoint_core::KernelConfig;

#[derive(Parser)]
#[command(author, version, about = "Waypoint - migration orchestration kernel")]
struct Args {
    /// Runtime directory (defaults to $WAYPOINT_RUNTIME_PATH or ./.waypoint)
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Write a default config.json into the runtime directory
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// List recent runs
    Runs {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Print the summary of one run
    Show {
        run_id: String,
    },
    /// List the checkpoints of a run
    Checkpoints {
        run_id: String,
        /// Print the full latest checkpoint as JSON
        #[arg(long)]
        latest: bool,
    },
    /// Print the effective configuration
    Config,
}

fn open_db(config: &KernelConfig) -> anyhow::Result<KernelDb> {
    let path = config.db_path();
    anyhow::ensure!(path.exists(), "No database at {:?}", path);
    KernelDb::open_at(&path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Some(dir) = &args.runtime_dir {
        std::env::set_var(RUNTIME_PATH_ENV, dir);
    }
    let config = KernelConfig::load().context("Failed to load config")?;

    match args.command {
        CliCommand::Init { force } => {
            let path = config.runtime_dir().join(CONFIG_FILE);
            if path.exists() && !force {
                anyhow::bail!("{:?} already exists (use --force to overwrite)", path);
            }
            KernelConfig::default().save_to(&path)?;
            KernelDb::open_at(config.db_path())?;
            println!("Initialized {:?}", config.runtime_dir());
        }
        CliCommand::Runs { limit } => {
            let db = open_db(&config)?;
            let summaries = RunSummaryStore::new(&db).list(limit)?;
            if summaries.is_empty() {
                println!("No runs recorded");
            }
            for s in summaries {
                println!(
                    "{:<38} {:<10} retries={:<2} {:>8}ms  {}",
                    s.run_id,
                    s.final_phase,
                    s.retry_count,
                    s.duration_ms,
                    s.finished_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CliCommand::Show { run_id } => {
            let db = open_db(&config)?;
            let summary = RunSummaryStore::new(&db)
                .load(&run_id)?
                .with_context(|| format!("No summary for run '{}'", run_id))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        CliCommand::Checkpoints { run_id, latest } => {
            let db = open_db(&config)?;
            let store = SqliteCheckpointStore::new(&db);
            if latest {
                let checkpoint = store
                    .latest(&run_id)?
                    .with_context(|| format!("No checkpoints for run '{}'", run_id))?;
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            } else {
                for cp in store.list(&run_id)? {
                    println!(
                        "{:<44} step={:<4} {:<11} {:<10} frontier={:?}",
                        cp.id,
                        cp.step,
                        cp.phase,
                        cp.status.as_str(),
                        cp.frontier
                    );
                }
            }
        }
        CliCommand::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
