//! Snapshot Coordinator - Main entry point
//!
//! Runs the operator API (`serve`) or a single operator verb from the
//! command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use snapshot_coordinator::{
    api, config::Config, daemon::shutdown::ShutdownCoordinator, leadership, utils,
    CoordinatorError, RestoreOptions, SnapshotCoordinator,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// EX_TEMPFAIL: the caller may retry later.
const EXIT_RETRYABLE: u8 = 75;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the operator HTTP API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Take a backup now
    CreateBackup,
    /// List complete backups, newest first
    ListBackups,
    /// Show one backup
    DescribeBackup { id: String },
    /// Replace the ensemble's state with a backup
    Restore {
        id: String,
        /// Accept a backup older than the ensemble's current position
        #[arg(long)]
        allow_regression: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let coordinator = Arc::new(SnapshotCoordinator::from_config(&config)?);
    let leadership = leadership::from_config(&config.leadership, &config.node.id);

    match args.command {
        Command::Serve { port } => {
            serve(&config, coordinator, leadership, port).await?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let result = match leadership::ensure_leader(leadership.as_ref()).await {
                Ok(()) => run_verb(command, &coordinator).await,
                Err(e) => Err(e),
            };
            Ok(report(result))
        }
    }
}

async fn serve(
    config: &Config,
    coordinator: Arc<SnapshotCoordinator>,
    leadership: Arc<dyn leadership::Leadership>,
    port: Option<u16>,
) -> Result<()> {
    api::health::init_start_time();

    tracing::info!(
        "Starting snapshot-coordinator v{} (node_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.node.id
    );

    let port = port.unwrap_or(config.node.listen_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState::new(coordinator, leadership);
    let app = api::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.signalled());
    let server_handle = tokio::spawn(async move { server.await });

    shutdown.wait_for_signal().await?;
    let grace = Duration::from_secs(config.node.shutdown_grace_secs);
    shutdown.drain(&state.operations, grace).await;
    shutdown.trigger();

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}

/// Run one operator verb. Ctrl+C requests cancellation.
async fn run_verb(
    command: Command,
    coordinator: &SnapshotCoordinator,
) -> Result<serde_json::Value, CoordinatorError> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling if the operation still allows it");
            on_interrupt.cancel();
        }
    });

    let value = match command {
        Command::CreateBackup => json!(coordinator.create_backup(&cancel).await?),
        Command::ListBackups => json!(coordinator.list_backups().await?),
        Command::DescribeBackup { id } => json!(coordinator.describe_backup(&id).await?),
        Command::Restore {
            id,
            allow_regression,
        } => json!(
            coordinator
                .restore(&id, RestoreOptions { allow_regression }, &cancel)
                .await?
        ),
        Command::Serve { .. } => {
            return Err(CoordinatorError::Config(
                "serve is not a one-shot command".into(),
            ))
        }
    };
    Ok(value)
}

fn report(result: Result<serde_json::Value, CoordinatorError>) -> ExitCode {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            ExitCode::SUCCESS
        }
        Err(e) => {
            let body = json!({
                "error": e.kind(),
                "message": e.to_string(),
                "retryable": e.is_retryable(),
            });
            eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            if e.is_retryable() {
                ExitCode::from(EXIT_RETRYABLE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
