//! taxq-consumer - qualification event consumer
//!
//! Reads newline-delimited JSON qualification events from a file or stdin,
//! applies them to the shared database and periodically derives factors for
//! the records they touched. Stops on Ctrl+C, SIGTERM or end of input.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use taxq_common::config::{self, TomlConfig};
use taxq_ingest::services::recalculation;
use taxq_ingest::services::{EventIngestor, JsonLinesSource};
use tokio::io::BufReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for taxq-consumer
#[derive(Parser, Debug)]
#[command(name = "taxq-consumer")]
#[command(about = "Qualification event consumer")]
#[command(version)]
struct Args {
    /// Root folder holding the database
    #[arg(short, long, env = "TAXQ_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Database file (overrides <root-folder>/taxq.db)
    #[arg(short, long, env = "TAXQ_DATABASE")]
    database: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long, env = "TAXQ_CONFIG")]
    config: Option<PathBuf>,

    /// Event input (newline-delimited JSON); stdin when omitted
    #[arg(short, long, env = "TAXQ_INPUT")]
    input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = TomlConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = &toml_config.logging.level;
                format!("taxq_ingest={level},taxq_common={level},taxq_consumer={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting taxq-consumer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);
    let db_path =
        config::resolve_database_path(args.database.as_deref(), &toml_config, &root_folder);
    info!("Database: {}", db_path.display());

    let pool = taxq_common::db::init_database(&db_path)
        .await
        .context("Failed to open database")?;

    let cancel = CancellationToken::new();
    let consumer_config = toml_config.consumer.clone();

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let recalc = match consumer_config.recalc_interval_secs {
        0 => {
            info!("Periodic recalculation disabled");
            None
        }
        secs => Some(tokio::spawn(recalculation::run_periodic(
            pool.clone(),
            consumer_config.actor.clone(),
            Duration::from_secs(secs),
            cancel.clone(),
        ))),
    };

    let mut ingestor = EventIngestor::new(pool.clone(), consumer_config.clone());
    let outcome = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open event input {}", path.display()))?;
            info!("Reading events from {}", path.display());
            let mut source = JsonLinesSource::new(BufReader::new(file));
            ingestor.run(&mut source, cancel.clone()).await
        }
        None => {
            info!("Reading events from stdin");
            let mut source = JsonLinesSource::new(BufReader::new(tokio::io::stdin()));
            ingestor.run(&mut source, cancel.clone()).await
        }
    };

    // Settle whatever the consumer left pending before exiting
    cancel.cancel();
    if let Some(task) = recalc {
        if let Err(err) = task.await {
            warn!(error = %err, "Recalculation task ended abnormally");
        }
    }
    match recalculation::recalculate_pending(&pool, &consumer_config.actor).await {
        Ok(summary) => info!(
            recalculated = summary.recalculated,
            rejected = summary.rejected,
            "Final recalculation pass done"
        ),
        Err(err) => error!(error = %err, "Final recalculation pass failed"),
    }

    pool.close().await;

    let stats = outcome.context("Event consumer failed")?;
    info!(
        received = stats.received,
        created = stats.created,
        updated = stats.updated,
        "Shutdown complete"
    );
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
