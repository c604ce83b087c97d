use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use distributed_kvstore::config::NodeConfig;
use distributed_kvstore::server::KvNode;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// A node of the partitioned, replicated key-value store.
#[derive(Debug, Parser)]
#[command(name = "dkvstore-node", version)]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node as host:servicePort[:gossipPort].
    #[arg(long)]
    listen: Option<String>,

    /// Cluster member as host:servicePort[:gossipPort]. Repeatable.
    #[arg(long = "member")]
    members: Vec<String>,

    /// File listing one cluster member per line.
    #[arg(long)]
    node_list: Option<PathBuf>,

    #[arg(long)]
    replication_factor: Option<usize>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(cli: &Cli) -> anyhow::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(path) = &cli.node_list {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node list {}", path.display()))?;
        config.members = NodeConfig::parse_node_list(&text);
    }
    if !cli.members.is_empty() {
        config.members = cli.members.clone();
    }
    if let Some(rf) = cli.replication_factor {
        config.replication_factor = rf;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = build_config(&cli)?;
    tracing::info!(
        listen = %config.listen,
        members = config.members.len().max(1),
        replication_factor = config.replication_factor,
        virtual_nodes = config.virtual_nodes,
        "Starting key-value node"
    );

    // 1. Node (sockets, gossip, sweeps):
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let node = KvNode::start(&config, shutdown_tx).await?;

    // 2. Spawn stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            tracing::info!(
                alive = stats_node.detector.alive_members(),
                ring_nodes = stats_node.ring.node_count(),
                keys = stats_node.store.len(),
                store_bytes = stats_node.store.used_bytes(),
                cached_requests = stats_node.cache.len(),
                in_flight_calls = stats_node.client.in_flight(),
                "Node stats"
            );
        }
    });

    // 3. Run until SHUTDOWN or Ctrl+C:
    tracing::info!("Press Ctrl+C to shutdown");
    tokio::select! {
        _ = shutdown_rx.wait_for(|stop| *stop) => tracing::info!("Shutdown command received"),
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl+C")?;
            tracing::info!("Interrupted");
        }
    }

    node.stop();
    Ok(())
}
