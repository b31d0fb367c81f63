//! rnet-relay - TCP relay daemon
//!
//! Listens on one or more addresses and relays every accepted client to a
//! fixed target, one upstream connection per client.
//!
//! # Usage
//!
//! ```bash
//! # Relay a single route from flags
//! rnet-relay run --listen 0.0.0.0:7777 --target 10.0.0.5:7777
//!
//! # Relay every route in a config file
//! rnet-relay run --config relay.toml
//!
//! # Same, with the file named by the environment
//! RNET_RELAY_CONFIG=relay.toml rnet-relay run
//!
//! # Validate a config file without binding anything
//! rnet-relay check --config relay.toml
//!
//! # Enable debug logging
//! RUST_LOG=rnet=debug,rnet_relay=debug rnet-relay run --config relay.toml
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: stop every relay and exit

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rnet_relay::{start_all, RelayConfig, RouteConfig, CONFIG_ENV_VAR};

/// TCP relay built on reactive-net
#[derive(Parser, Debug)]
#[command(name = "rnet-relay", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start relaying until interrupted
    Run {
        /// Route config file (defaults to $RNET_RELAY_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address for a single route; overrides the config file
        #[arg(long, requires = "target")]
        listen: Option<SocketAddr>,

        /// Target address for a single route
        #[arg(long, requires = "listen")]
        target: Option<SocketAddr>,

        /// Name of the single route
        #[arg(long, default_value = "relay")]
        name: String,
    },
    /// Validate a config file and list its routes
    Check {
        /// Route config file (defaults to $RNET_RELAY_CONFIG)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit.or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from)) {
        Some(path) => Ok(path),
        None => bail!("No config file given: pass --config or set {CONFIG_ENV_VAR}"),
    }
}

fn load(path: &Path) -> Result<RelayConfig> {
    RelayConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            listen,
            target,
            name,
        } => {
            let config = match (listen, target) {
                (Some(listen), Some(target)) => {
                    let config = RelayConfig::single(RouteConfig::new(name, listen, target));
                    config.validate().context("Invalid route")?;
                    config
                }
                _ => load(&config_path(config)?)?,
            };
            run_relays(config)
        }
        Command::Check { config } => {
            let path = config_path(config)?;
            let config = load(&path)?;
            for route in &config.routes {
                println!("{} - {} to {}", route.name, route.listen, route.target);
            }
            println!("{}: {} route(s) OK", path.display(), config.routes.len());
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_relays(config: RelayConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("rnet=info".parse()?)
                .add_directive("rnet_relay=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        routes = config.routes.len(),
        "rnet-relay starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let relays = start_all(&config).context("Failed to start relays")?;
    for relay in &relays {
        info!(relay = %relay, bound = ?relay.local_addr(), "Relay listening");
    }

    cancel_token.cancelled().await;

    for relay in &relays {
        relay.stop();
    }

    info!("rnet-relay stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
