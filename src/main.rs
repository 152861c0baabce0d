use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use stagehand::config::{Config, StoreBackend};
use stagehand::health::HealthMetrics;
use stagehand::processor::EventProcessor;
use stagehand::server;
use stagehand::store::memory::MemoryStore;
use stagehand::store::mongo::MongoStore;
use stagehand::store::{Store, StoreWriter};

/// Live monitoring backend for Apache Spark applications.
#[derive(Parser)]
#[command(name = "stagehand", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("stagehand {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading config from {}", path.display()))?
        }
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting stagehand",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Signal handling.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
            cancel.cancel();
        });
    }

    let health = if cfg.health.enabled {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
        health
            .start(&cfg.health.addr, cancel.clone())
            .await
            .context("starting health server")?;
        Some(health)
    } else {
        None
    };

    let store = match cfg.store.backend {
        StoreBackend::Mongo => Store::Mongo(
            MongoStore::connect(&cfg.store)
                .await
                .context("connecting to store")?,
        ),
        StoreBackend::Memory => Store::Memory(MemoryStore::new()),
    };
    tracing::info!(store = store.name(), "store ready");

    let (writer, writer_task) = StoreWriter::spawn(store, health.clone());

    // One channel, one consumer: events for a stream apply in arrival order.
    let (tx, mut rx) = mpsc::channel(1024);
    let task_records = cfg.engine.task_records;
    let processor_health = health.clone();
    let processor_task = tokio::spawn(async move {
        let mut processor = EventProcessor::new(writer, task_records, processor_health);
        while let Some(event) = rx.recv().await {
            processor.handle(&event);
        }
    });

    server::serve(&cfg.listen, tx, cancel.clone(), health).await?;

    // Intake is down; drain the processor, then the writer.
    processor_task.await.context("joining processor task")?;
    writer_task.await.context("joining store writer")?;

    tracing::info!("stagehand stopped");
    Ok(())
}
