//! rdmsync CLI - compare and push directories into local datasets.
//!
//! Every command works on a SQLite-backed queue and a directory acting as
//! the destination, so `persist` and `work` can run in separate processes.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rdmsync_common::{Credentials, DatasetId, EngineConfig};
use rdmsync_destination::LocalDestination;
use rdmsync_plugin::{create_default_registry, CompareRequest, StreamParams};
use rdmsync_store::SqliteStore;
use rdmsync_sync::{StoreRequest, SyncEngine};
use rdmsync_tree::{Action, Node, Status};

#[derive(Parser)]
#[command(name = "rdmsync")]
#[command(about = "rdmsync - Synchronize file trees into research datasets")]
#[command(version)]
struct Cli {
    /// More logging (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Queue and cache database.
    #[arg(long, global = true, default_value = "rdmsync.db")]
    store: PathBuf,

    /// Directory holding the datasets.
    #[arg(long, global = true, default_value = "datasets")]
    dest: PathBuf,

    /// Engine configuration (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User acting on the destination.
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a directory with a dataset and print the annotated diff.
    Compare {
        /// Source directory.
        #[arg(short, long)]
        source: PathBuf,

        /// Dataset id.
        #[arg(short, long)]
        dataset: String,
    },

    /// Queue the changes needed to bring a dataset in line with a directory.
    Persist {
        /// Source directory.
        #[arg(short, long)]
        source: PathBuf,

        /// Dataset id.
        #[arg(short, long)]
        dataset: String,

        /// Also delete dataset files missing from the source.
        #[arg(long)]
        all: bool,
    },

    /// Run workers until interrupted.
    Work {
        /// Number of workers (default: from configuration).
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show the job state of a dataset.
    Status {
        /// Dataset id.
        #[arg(short, long)]
        dataset: String,

        /// Files whose progress markers to show.
        #[arg(short, long)]
        file: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = builder.with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Commands::Work {
        workers: Some(workers),
    } = &cli.command
    {
        config.workers = *workers;
    }

    let engine = open_engine(&cli.store, &cli.dest, config)?;
    let creds = Credentials::new(cli.user.clone(), "local");

    match cli.command {
        Commands::Compare { source, dataset } => cmd_compare(&engine, &creds, &source, &dataset).await,

        Commands::Persist {
            source,
            dataset,
            all,
        } => cmd_persist(&engine, creds, &source, &dataset, all).await,

        Commands::Work { .. } => cmd_work(&engine).await,

        Commands::Status { dataset, file } => cmd_status(&engine, &dataset, &file).await,
    }
}

fn open_engine(store: &Path, dest: &Path, config: EngineConfig) -> Result<SyncEngine> {
    let store = SqliteStore::open(store)
        .with_context(|| format!("Failed to open store {}", store.display()))?;
    let destination = LocalDestination::new(dest)
        .with_context(|| format!("Failed to open destination {}", dest.display()))?
        .with_hash_type(config.default_hash.clone());
    let engine = SyncEngine::new(
        Arc::new(store),
        Arc::new(destination),
        create_default_registry(),
        config,
    )?;
    Ok(engine)
}

fn compare_request(source: &Path, dataset: &str) -> Result<CompareRequest> {
    let source = source
        .canonicalize()
        .with_context(|| format!("Source directory not found: {}", source.display()))?;
    Ok(CompareRequest {
        plugin_id: "local".to_string(),
        plugin: "local".to_string(),
        url: source.to_string_lossy().to_string(),
        persistent_id: dataset.to_string(),
        ..CompareRequest::default()
    })
}

/// Compare a directory with a dataset.
async fn cmd_compare(
    engine: &SyncEngine,
    creds: &Credentials,
    source: &Path,
    dataset: &str,
) -> Result<()> {
    let req = compare_request(source, dataset)?;
    let response = engine
        .compare(&req, creds, true)
        .await
        .context("Compare failed")?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// The action that brings a compared node in line with the source.
fn action_for(node: &Node, with_deletes: bool) -> Option<Action> {
    match node.status {
        Status::New => Some(Action::Copy),
        Status::Updated => Some(Action::Update),
        Status::Deleted if with_deletes => Some(Action::Delete),
        _ => None,
    }
}

/// Queue every actionable node of a compare.
async fn cmd_persist(
    engine: &SyncEngine,
    creds: Credentials,
    source: &Path,
    dataset: &str,
    all: bool,
) -> Result<()> {
    let req = compare_request(source, dataset)?;
    let response = engine
        .compare(&req, &creds, false)
        .await
        .context("Compare failed")?;

    let selected: Vec<Node> = response
        .data
        .into_iter()
        .filter(|n| n.is_file)
        .filter_map(|n| action_for(&n, all).map(|action| n.with_action(action)))
        .collect();
    if selected.is_empty() {
        println!("Dataset {} is up to date.", dataset);
        return Ok(());
    }
    info!("Selected {} files", selected.len());

    let job = engine
        .start_persist(StoreRequest {
            plugin: req.plugin.clone(),
            stream_params: StreamParams::from(&req),
            persistent_id: dataset.to_string(),
            credentials: creds,
            selected_nodes: selected,
            send_email_on_success: false,
        })
        .await
        .context("Failed to queue job")?;

    if job.writable_nodes.is_empty() {
        println!("Nothing left to do for {}.", job.dataset);
    } else {
        println!("Job queued successfully!");
        println!("  ID: {}", job.id);
        println!("  Dataset: {}", job.dataset);
        println!("  Files: {}", job.writable_nodes.len());
    }
    Ok(())
}

/// Run the worker pool until Ctrl-C.
async fn cmd_work(engine: &SyncEngine) -> Result<()> {
    let shutdown = CancellationToken::new();
    let handles = engine.spawn_workers(shutdown.clone());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, stopping workers");
    shutdown.cancel();

    for handle in handles {
        handle.await.context("Worker panicked")?;
    }
    Ok(())
}

/// Print lock, last error and progress markers of a dataset.
async fn cmd_status(engine: &SyncEngine, dataset: &str, files: &[String]) -> Result<()> {
    let dataset = DatasetId::new(dataset).context("Invalid dataset id")?;
    let status = engine.status(&dataset).await?;

    println!("Dataset: {}", status.dataset);
    println!("  In progress: {}", if status.locked { "yes" } else { "no" });
    println!("  Queued jobs: {}", status.queued);
    if let Some(error) = &status.last_error {
        println!("  Last failure: {}", error);
    }

    if !files.is_empty() {
        let progress = engine.progress(&dataset, files).await?;
        for file in files {
            let marker = progress.get(file).map(String::as_str).unwrap_or("-");
            println!("  {}: {}", file, marker);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_for_status() {
        let mut node = Node::file("a.txt");
        node.status = Status::New;
        assert_eq!(action_for(&node, false), Some(Action::Copy));
        node.status = Status::Updated;
        assert_eq!(action_for(&node, false), Some(Action::Update));
        node.status = Status::Deleted;
        assert_eq!(action_for(&node, false), None);
        assert_eq!(action_for(&node, true), Some(Action::Delete));
        node.status = Status::Unknown;
        assert_eq!(action_for(&node, true), None);
    }

    #[test]
    fn test_cli_parses_persist() {
        let cli = Cli::try_parse_from([
            "rdmsync", "persist", "--source", "data", "--dataset", "doi:X", "--all",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Persist { all: true, .. }));
        assert_eq!(cli.store, PathBuf::from("rdmsync.db"));
    }

    #[test]
    fn test_verbosity_counts() {
        let cli = Cli::try_parse_from(["rdmsync", "-vv", "work", "--workers", "2"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Work { workers: Some(2) }));
    }
}
