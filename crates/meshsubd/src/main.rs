//! meshsubd - brokerless cluster pub/sub node
//!
//! Runs one node over TCP, dials the configured seeds until they answer and
//! logs node statistics until interrupted.

use clap::Parser;
use meshsub_core::identity::fresh_node_id;
use meshsub_net::TcpTransport;
use meshsubd::{Config, Node};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often unanswered seeds are dialed again
const SEED_RETRY: Duration = Duration::from_secs(5);

/// How often node statistics are logged
const STATS_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let level = if config.verbose { "meshsubd=debug" } else { "meshsubd=info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.parse()?)
        .add_directive(level.replace("meshsubd", "meshsub_net").parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let settings = config.node_settings();
    let node_id = fresh_node_id(&settings.name);
    let (transport, events) = TcpTransport::bind(node_id, settings.name.clone(), config.listen).await?;
    let node = Node::spawn(settings, transport.clone(), events);
    let pubsub = node.pubsub();

    let seeds = config.seeds.clone();
    let dialer = transport.clone();
    let seed_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SEED_RETRY);
        let mut joined = vec![None; seeds.len()];
        loop {
            ticker.tick().await;
            for (addr, peer) in seeds.iter().zip(joined.iter_mut()) {
                if peer.map(|id| dialer.is_connected(&id)).unwrap_or(false) {
                    continue;
                }
                match dialer.connect(*addr).await {
                    Ok(id) => {
                        info!("Joined seed {} ({})", addr, id);
                        *peer = Some(id);
                    }
                    Err(e) => debug!("Seed {} not reachable: {}", addr, e),
                }
            }
        }
    });

    let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = stats_ticker.tick() => match pubsub.stats().await {
                Ok(stats) => info!(
                    "Node {}: {} peers, {} subscribers on {} topics, {} labels",
                    stats.node, stats.peers_up, stats.subscribers, stats.topics, stats.labels
                ),
                Err(e) => warn!("Stats unavailable: {}", e),
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    seed_task.abort();
    node.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }
    if let Err(e) = init_tracing(&config) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "meshsubd v{} - brokerless cluster pub/sub",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(config).await {
        error!("Node error: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
