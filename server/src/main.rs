use anyhow::{Context, Result};
use clap::Parser;
use cod_server::{Args, ClusterNode, NodeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::try_from(args).context("invalid configuration")?;
    info!(
        node = %config.node_name,
        http = %config.http_addr,
        bootstrap = config.bootstrap,
        join = ?config.join,
        data_dir = ?config.data_dir,
        "starting node"
    );

    let node = ClusterNode::start(config).await.context("failed to start node")?;
    info!(node = %node.name(), address = %node.advertise_addr(), "node ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    node.shutdown().await;
    Ok(())
}
