mod kernel;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use regionmesh_protocol::{
    ConfigHandle, ExecutionHooks, GossipValue, ManagerConfig, NeighborConnectionManager,
    NetworkConfig, NodeAddress, NodeIdentifier, NodeRuntime, RuntimeConfig, StaticNodeLookup,
};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use crate::kernel::MaxGossipKernel;

#[derive(Parser)]
#[command(name = "regionmesh-node", about = "regionmesh neighbor-gossip node")]
struct Cli {
    /// Id of this node (e.g. serverA)
    #[arg(long, env = "REGIONMESH_NODE_ID")]
    node_id: String,

    /// Address to listen on for neighbor links
    #[arg(long, env = "REGIONMESH_LISTEN", default_value = "127.0.0.1:7600")]
    listen: String,

    /// Known neighbor as ID=HOST:PORT, repeatable
    #[arg(long = "neighbor", value_parser = parse_neighbor)]
    neighbors: Vec<(String, NodeAddress)>,

    /// Network configuration file (TOML), reloaded on SIGHUP
    #[arg(long, env = "REGIONMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Pause between execution cycles in milliseconds
    #[arg(long, default_value = "2000")]
    cycle_interval_ms: u64,

    /// Value this node feeds into the max-gossip kernel
    #[arg(long, default_value = "0")]
    seed_value: i64,
}

fn parse_address(s: &str) -> Result<NodeAddress, String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {s}"))?;
    let port = port.parse().map_err(|e| format!("bad port in {s}: {e}"))?;
    Ok(NodeAddress::new(host, port))
}

fn parse_neighbor(s: &str) -> Result<(String, NodeAddress), String> {
    let (id, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got {s}"))?;
    Ok((id.to_string(), parse_address(address)?))
}

struct LogHooks;

impl ExecutionHooks for LogHooks {
    fn post_cycle(&self, node: &NodeIdentifier, round: u64, value: &GossipValue) {
        tracing::debug!(node = %node, round, value = ?value, "Cycle complete");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let network = match &cli.config {
        Some(path) => NetworkConfig::load(path)
            .with_context(|| format!("loading network config {}", path.display()))?,
        None => NetworkConfig::default(),
    };
    let network = ConfigHandle::new(network).context("invalid network config")?;

    let node_id = NodeIdentifier::new(cli.node_id.as_str());
    let listen = parse_address(&cli.listen).map_err(anyhow::Error::msg)?;
    let lookup = StaticNodeLookup::new().with(node_id.clone(), listen);
    let mut neighbor_ids = Vec::with_capacity(cli.neighbors.len());
    for (id, address) in cli.neighbors {
        let id = NodeIdentifier::new(id);
        lookup.register(id.clone(), address);
        neighbor_ids.push(id);
    }

    tracing::info!(
        node = %node_id,
        listen = %cli.listen,
        neighbors = neighbor_ids.len(),
        seed = cli.seed_value,
        "Starting regionmesh node"
    );

    let manager =
        NeighborConnectionManager::new(Arc::new(lookup), network.clone(), ManagerConfig::default());
    manager
        .start(node_id.clone(), neighbor_ids)
        .await
        .context("starting neighbor manager")?;

    let runtime = NodeRuntime::new(
        node_id.clone(),
        MaxGossipKernel::new(cli.seed_value),
        manager.clone(),
        RuntimeConfig {
            cycle_interval: Duration::from_millis(cli.cycle_interval_ms),
        },
    )
    .with_hooks(LogHooks);
    runtime.start_executing().context("starting execution loop")?;

    if let Some(path) = cli.config.clone() {
        watch_config(network.clone(), path);
    }

    shutdown_signal().await;

    tracing::info!("Shutting down gracefully");
    runtime.stop_executing().await;
    manager.stop().await;

    tracing::info!(
        node = %node_id,
        executions = runtime.execution_count(),
        value = ?runtime.local_value(),
        "Node shut down"
    );
    Ok(())
}

#[cfg(unix)]
fn watch_config(network: ConfigHandle, path: PathBuf) {
    tokio::spawn(reload_on_hangup(network, path));
}

#[cfg(not(unix))]
fn watch_config(_network: ConfigHandle, path: PathBuf) {
    tracing::info!(path = %path.display(), "Config reload on signal is not supported here");
}

#[cfg(unix)]
async fn reload_on_hangup(network: ConfigHandle, path: PathBuf) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGHUP handler: {e}");
            return;
        }
    };
    while hangup.recv().await.is_some() {
        if let Err(e) = network.reload_from(&path) {
            tracing::warn!("Config reload failed, keeping previous: {e}");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
