#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunnelgate
//!
//! Expose an in-process command surface to a remote browser for as long as
//! the process runs, through an anonymous quick tunnel and a six-digit PIN.
//!
//! ## Subcommands
//!
//! - `tunnelgate serve` (default) - enable remote access with the demo
//!   procedures, print URL and PIN, disable on SIGINT/SIGTERM
//! - `tunnelgate install` - only make sure the tunnel binary is present
//!
//! ## HTTP surface (gateway port, reached through the tunnel)
//!
//! | Method | Path           | Auth     | Description                  |
//! |--------|----------------|----------|------------------------------|
//! | GET    | `/`, `/login`  | No       | PIN login page               |
//! | GET    | `/ws`          | In-band  | Gateway socket               |
//! | GET    | `/api/health`  | No       | Liveness probe               |

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use tunnelgate::config::Config;
use tunnelgate::tunnel::ensure_binary_available;
use tunnelgate::{demo, RemoteAccessController, RemoteStatus};

/// Temporary PIN-gated remote access through a quick tunnel.
#[derive(Parser)]
#[command(name = "tunnelgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable remote access until interrupted (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Download the tunnel binary if it is missing, then exit.
    Install {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { config: None }) {
        Commands::Serve { config } => run_serve(config.as_deref()).await,
        Commands::Install { config } => run_install(config.as_deref()).await,
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config = Config::load(path).context("failed to load configuration")?;
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Ok(config)
}

async fn run_serve(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!("tunnelgate v{} starting", env!("CARGO_PKG_VERSION"));

    let router = demo::router().context("failed to build command router")?;
    let controller = RemoteAccessController::new(&config, Arc::new(router));

    let mut status_rx = controller.subscribe_status();
    let status_task = tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            report_status(&status);
        }
    });

    let enabled = tokio::select! {
        result = controller.enable() => Some(result),
        signal = shutdown_signal() => {
            signal?;
            None
        }
    };

    match enabled {
        Some(Ok(_)) => shutdown_signal().await?,
        Some(Err(e)) => {
            status_task.abort();
            return Err(e).context("failed to enable remote access");
        }
        None => {}
    }

    info!("Shutting down...");
    controller.disable().await;
    status_task.abort();
    info!("Goodbye");
    Ok(())
}

async fn run_install(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let binary = config.tunnel.binary();

    let downloaded = ensure_binary_available(&binary, |percent| {
        eprint!("\rDownloading tunnel binary... {percent:>3}%");
        if percent == 100 {
            eprintln!();
        }
        let _ = std::io::stderr().flush();
    })
    .await
    .context("failed to install tunnel binary")?;

    if downloaded {
        println!("Installed tunnel binary at {}", binary.display());
    } else {
        println!("Tunnel binary already present at {}", binary.display());
    }
    Ok(())
}

fn report_status(status: &RemoteStatus) {
    match status {
        RemoteStatus::Active { url, pin, clients } => {
            println!();
            println!("  Remote access is active");
            println!("  URL:     {url}");
            println!("  PIN:     {pin}");
            println!("  Clients: {clients}");
            println!();
        }
        RemoteStatus::Downloading { progress } => {
            eprint!("\rDownloading tunnel binary... {progress:>3}%");
            if *progress == 100 {
                eprintln!();
            }
        }
        RemoteStatus::Starting => info!("Starting gateway and tunnel"),
        RemoteStatus::Disabled => info!("Remote access disabled"),
        RemoteStatus::Error { message } => eprintln!("Remote access failed: {message}"),
    }
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to listen for Ctrl-C")?;
        info!("Received SIGINT");
    }
    Ok(())
}
