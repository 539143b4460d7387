// iogov - Resource Governor Entry Point
//
// Runs the singleton governor process: binds the configured port, serves
// worker connections, and shuts down cleanly on SIGINT/SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use iogov::{GovernorConfig, Server};
use tokio::sync::watch;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// Distributed I/O resource governor
#[derive(Parser, Debug)]
#[command(name = "iogov")]
#[command(version = "0.1.0")]
#[command(about = "Quota arbitration for massively parallel I/O jobs", long_about = None)]
struct Args {
    /// Path to a JSON quota configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured bind host
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(filter.into())
                .from_env_lossy(),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => GovernorConfig::load(path)
            .with_context(|| format!("Invalid configuration {}", path.display()))?,
        None => GovernorConfig::from_env().context("Invalid configuration environment")?,
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }

    let server = Server::bind(config)
        .await
        .context("Cannot start resource governor")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Termination signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

/// Resolve on SIGINT or, on Unix, SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
