//! OrderFlow backend worker process.
//!
//! Boots the store and object storage, wires the AI ports, and runs the
//! background worker pool plus the periodic ack poller. The HTTP front-end
//! lives elsewhere; it enqueues work through the same task queue.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderflow_backend::ai::{ScriptedEmbedder, ScriptedLlm};
use orderflow_backend::config::Config;
use orderflow_backend::export::FsDropzone;
use orderflow_backend::objectstore::FsObjectStore;
use orderflow_backend::store::Db;
use orderflow_backend::workers::{spawn_ack_poll_loop, spawn_workers, Executor};

#[derive(Parser, Debug)]
#[command(name = "orderflow", about = "OrderFlow order-processing backend")]
struct Args {
    /// Override the database path from the environment.
    #[arg(long, env = "DATABASE_PATH")]
    database_path: Option<String>,

    /// Number of background workers.
    #[arg(long, env = "WORKER_COUNT")]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "orderflow_backend=info,orderflow=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(path) = args.database_path {
        config.database_path = path;
    }
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    info!(
        database = %config.database_path,
        object_store = %config.object_store_root,
        workers = config.worker_count,
        "starting orderflow backend"
    );

    let db = Db::open(&config.database_path).context("open database")?;
    let store = Arc::new(FsObjectStore::new(config.object_store_root.clone()));

    // Provider adapters are selected by configuration at the composition
    // root; the scripted ports stand in until real adapters are wired.
    let executor = Arc::new(Executor {
        db,
        store,
        llm: Arc::new(ScriptedLlm::new()),
        embedder: Arc::new(ScriptedEmbedder::new(1536)),
        transport: Arc::new(FsDropzone),
        config_pepper: config.config_pepper.clone(),
    });

    let pool = spawn_workers(executor, config.worker_count);
    spawn_ack_poll_loop(pool.clone(), config.ack_poll_interval_secs);

    info!("worker pool running; waiting for shutdown signal");
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    Ok(())
}
