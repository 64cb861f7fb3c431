//! relayd - Relay integrity node
//!
//! Runs one node of the Relay mesh: admits events into the DAG, gossips
//! them to peers, resolves forks, watches for abuse and rides out network
//! partitions.

use anyhow::Context;
use clap::Parser;
use relay_net::{PeerId, TcpTransport};
use relayd::config::Config;
use relayd::{RelayNode, Sinks, Storage};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const TRANSPORT_QUEUE_DEPTH: usize = 1024;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let level = if config.verbose { "relayd=debug" } else { "relayd=info" };
    let filter = match level.parse::<Directive>() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("relayd v{} - Relay integrity node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("relayd failed: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let node_config = config.node()?;

    let storage = if config.ephemeral {
        info!("Running ephemeral, nothing is written to disk");
        Storage::temporary()?
    } else {
        Storage::open(&config.data_dir)
            .with_context(|| format!("opening {}", config.data_dir.display()))?
    };

    let node_id = config
        .node_id
        .clone()
        .map(PeerId::new)
        .unwrap_or_else(PeerId::random);
    let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_QUEUE_DEPTH);
    let transport = TcpTransport::new(node_id.clone(), transport_tx);
    let bound = transport
        .listen(config.listen)
        .await
        .with_context(|| format!("listening on {}", config.listen))?;
    info!("Node {} listening on {}", node_id, bound);

    let node = RelayNode::start(
        node_config,
        transport.clone(),
        transport_rx,
        Some(Arc::new(storage)),
        Sinks::logging(),
    )
    .await?;

    for addr in &config.bootstrap {
        match transport.connect(*addr).await {
            Ok(peer) => info!("Connected to bootstrap peer {} at {}", peer, addr),
            Err(e) => warn!("Bootstrap peer {} unreachable: {}", addr, e),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    node.shutdown().await;
    Ok(())
}
