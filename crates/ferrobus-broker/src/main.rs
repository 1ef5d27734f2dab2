//! ferrobusd - the ferrobus message broker daemon.
//!
//! # Configuration
//!
//! Layered, highest priority last:
//!
//! 1. Compiled defaults (permissive policy, default limits)
//! 2. Config file (`--config <path>`, TOML)
//! 3. Environment (`FERROBUS_SOCKET`, `FERROBUS_LOG`)
//! 4. CLI arguments

use anyhow::{Context, Result};
use clap::Parser;
use ferrobus_broker::{run_listener, signal_task, BrokerConfig};
use ferrobus_core::{Bus, Engine};
use ferrobus_policy::PolicyRegistry;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// ferrobusd - process-local message broker
#[derive(Parser, Debug)]
#[command(name = "ferrobusd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Listening socket path (overrides config and FERROBUS_SOCKET)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Remove a stale socket file before binding
    #[arg(long)]
    replace: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("FERROBUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut config = BrokerConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(socket) = args.socket {
        config.socket = Some(socket);
    }
    let socket_path = config.socket_path();

    if args.replace && socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let policy = PolicyRegistry::new(config.policy.clone());
    let needs_groups = policy.needs_groups();
    let owner_uid = nix::unistd::Uid::current().as_raw();
    let bus = Bus::new(policy, config.limits, owner_uid);
    info!(guid = bus.guid(), socket = %socket_path.display(), "ferrobusd starting");

    let (engine, events) = Engine::new(bus);

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    let listener_task = tokio::spawn(run_listener(listener, events.clone(), needs_groups));
    let signals = tokio::spawn(signal_task(events));

    let _bus = engine.run().await;

    listener_task.abort();
    signals.abort();
    let _ = std::fs::remove_file(&socket_path);
    info!("ferrobusd stopped");
    Ok(())
}
