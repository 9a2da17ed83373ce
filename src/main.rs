//! nx-local-cache - remote build cache server and client
//!
//! Runs the cache server, manages its projects, and drives the cache
//! adapter from the command line.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nx_local_cache::client::{HttpRemoteCache, RemoteCache};
use nx_local_cache::config::{ClientArgs, ClientConfig, ServerArgs, ServerConfig, StorageArgs};
use nx_local_cache::index::ArtifactIndex;
use nx_local_cache::server;
use nx_local_cache::types::Task;

#[derive(Debug, Parser)]
#[command(name = "nx-local-cache", version, about = "Remote build artifact cache")]
struct Cli {
    /// Log debug details, including why cache operations failed
    #[arg(long, short, global = true, env = "NX_VERBOSE_LOGGING")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the cache server
    Serve(ServerArgs),

    /// Manage projects in the artifact index
    Project {
        #[command(flatten)]
        storage: StorageArgs,

        #[command(subcommand)]
        command: ProjectCommand,
    },

    /// Fetch artifacts into a cache directory
    Retrieve {
        #[command(flatten)]
        client: ClientArgs,

        /// Local cache directory
        #[arg(long)]
        cache_dir: PathBuf,

        /// Hashes to fetch
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Upload artifacts from a cache directory
    Store {
        #[command(flatten)]
        client: ClientArgs,

        /// Local cache directory
        #[arg(long)]
        cache_dir: PathBuf,

        /// JSON file with the run's tasks, for provenance headers
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// Hashes to upload
        #[arg(required = true)]
        hashes: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Register a new project and print it
    Create {
        name: String,

        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },

    /// List a project's artifacts as JSON
    Artifacts { project_id: String },
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Command::Serve(args) => {
            let config = ServerConfig::from(&args);
            info!(
                bind = %config.bind,
                data_dir = %config.data_dir.display(),
                "Starting cache server"
            );
            if let Err(e) = server::serve(&config).await {
                error!(error = %e, "Cache server failed");
                return Err(e);
            }
        }
        Command::Project { storage, command } => run_project(&storage, command).await?,
        Command::Retrieve {
            client,
            cache_dir,
            hashes,
        } => run_retrieve(&client, &cache_dir, hashes).await?,
        Command::Store {
            client,
            cache_dir,
            tasks,
            hashes,
        } => run_store(&client, &cache_dir, tasks, hashes).await?,
    }

    Ok(())
}

async fn run_project(storage: &StorageArgs, command: ProjectCommand) -> Result<()> {
    let database = storage.database();
    let index = ArtifactIndex::open(&database)
        .await
        .with_context(|| format!("Failed to open index at {}", database.display()))?;

    match command {
        ProjectCommand::Create { name, id } => {
            let project = match id {
                Some(id) => index.create_project_with_id(&id, &name).await,
                None => index.create_project(&name).await,
            }
            .context("Failed to create project")?;
            println!("{}", serde_json::to_string_pretty(&project)?);
        }
        ProjectCommand::Artifacts { project_id } => {
            let artifacts = index
                .list_project(&project_id)
                .await
                .context("Failed to list artifacts")?;
            println!("{}", serde_json::to_string_pretty(&artifacts)?);
        }
    }
    Ok(())
}

async fn run_retrieve(args: &ClientArgs, cache_dir: &Path, hashes: Vec<String>) -> Result<()> {
    let config = ClientConfig::from(args);
    let cache = HttpRemoteCache::from_config(&config, Vec::new())
        .context("Failed to create cache client")?;

    let results: Vec<(String, bool)> = futures::stream::iter(hashes)
        .map(|hash| {
            let cache = &cache;
            async move {
                let hit = cache.retrieve(&hash, cache_dir).await;
                (hash, hit)
            }
        })
        .buffer_unordered(config.parallel)
        .collect()
        .await;

    for (hash, hit) in &results {
        println!("{} {}", hash, if *hit { "hit" } else { "miss" });
    }
    let hits = results.iter().filter(|(_, hit)| *hit).count();
    info!(hits = hits, misses = results.len() - hits, "Retrieve finished");
    Ok(())
}

async fn run_store(
    args: &ClientArgs,
    cache_dir: &Path,
    tasks_file: Option<PathBuf>,
    hashes: Vec<String>,
) -> Result<()> {
    let tasks: Vec<Task> = match tasks_file {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse tasks in {}", path.display()))?
        }
        None => Vec::new(),
    };

    let config = ClientConfig::from(args);
    let cache =
        HttpRemoteCache::from_config(&config, tasks).context("Failed to create cache client")?;

    for hash in &hashes {
        if !cache.store(hash, cache_dir).await {
            println!("{} skipped", hash);
        }
    }

    let summary = cache.drain_with_summary().await;
    println!("uploaded {} failed {}", summary.succeeded, summary.failed);
    Ok(())
}
