pub mod commands;
pub mod config;
pub mod error;
pub mod instance;
pub mod lock;
pub mod paths;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod store;
#[cfg(test)]
mod testing;
pub mod validation;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use commands::AppState;
use config::{default_settings_path, load_settings};
pub use error::{AppError, ErrorKind, Result};
use instance::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "codedock")]
#[command(version, about = "Per-repository code-server instances behind a shared nginx")]
pub struct Cli {
    /// Settings file; created with defaults when missing
    #[arg(short, long, env = "CODEDOCK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Reconcile, then serve the control API (default)
    Serve,
    /// Repair state left by a crash and print what changed
    Reconcile,
    /// Stop every instance and kill leftover editor processes
    KillAll,
}

/// Initialize `log` output. `RUST_LOG` overrides the default level.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init()
        .ok();
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings_path = cli.config.unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path)?;
    log::info!("Loaded settings from {}", settings_path.display());

    let orchestrator = Arc::new(Orchestrator::from_settings(&settings)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings.listen, orchestrator).await,
        Command::Reconcile => print_json(&orchestrator.reconcile().await),
        Command::KillAll => print_json(&orchestrator.kill_all().await),
    }
}

async fn serve(listen: SocketAddr, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let report = orchestrator.reconcile().await;
    if !report.errors.is_empty() {
        log::warn!(
            "Startup reconcile finished with {} error(s): {:?}",
            report.errors.len(),
            report.errors
        );
    }

    let app = commands::router(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| AppError::config(format!("Failed to bind {}: {}", listen, e)))?;
    log::info!("Control API listening on http://{}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Editors run in their own process groups and outlive the control API;
    // the next start reconciles against them.
    log::info!("Control API stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    log::info!("Shutdown signal received");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
