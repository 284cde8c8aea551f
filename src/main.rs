//! lanlink CLI: run an endpoint or a switch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lanlink::adapter::DeviceFactory;
use lanlink::platform::default_platform;
use lanlink::{
    AccessConfig, SwitchConfig, SwitchServer, Worker, DEFAULT_ACCESS_CONFIG,
    DEFAULT_SWITCH_CONFIG,
};

#[derive(Parser)]
#[command(name = "lanlink")]
#[command(about = "Overlay virtual LAN endpoint and switch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a switch with a local TUN/TAP device
    Access {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_ACCESS_CONFIG)]
        config: String,
    },
    /// Serve endpoints
    Switch {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_SWITCH_CONFIG)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG, then RUST_LOG_LEVEL, then --verbose
    let fallback = if cli.verbose { "debug" } else { "info" };
    let default_level = std::env::var("RUST_LOG_LEVEL").unwrap_or_else(|_| fallback.to_string());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();

    let res = match cli.command {
        Command::Access { config } => run_access(&config).await,
        Command::Switch { config } => run_switch(&config).await,
    };
    if let Err(e) = &res {
        error!("{:#}", e);
    }
    res
}

#[cfg(target_os = "linux")]
fn device_factory() -> Result<Arc<dyn DeviceFactory>> {
    Ok(Arc::new(lanlink::adapter::KernelFactory))
}

#[cfg(not(target_os = "linux"))]
fn device_factory() -> Result<Arc<dyn DeviceFactory>> {
    anyhow::bail!("No virtual device support on {}", std::env::consts::OS)
}

async fn run_access(path: &str) -> Result<()> {
    info!(path, "Loading endpoint configuration");
    let config = AccessConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from: {path}"))?;

    let worker = Worker::new(config, device_factory()?, default_platform());
    worker.start().await.context("Failed to start endpoint")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Interrupted, shutting down");
    worker.stop().await;
    Ok(())
}

async fn run_switch(path: &str) -> Result<()> {
    info!(path, "Loading switch configuration");
    let config = SwitchConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from: {path}"))?;

    let server = SwitchServer::bind(config)
        .await
        .context("Failed to start switch")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Interrupted, shutting down");
    server.stop().await;
    Ok(())
}
