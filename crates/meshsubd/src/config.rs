//! Configuration for meshsubd

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// meshsubd - brokerless cluster pub/sub node
#[derive(Parser, Debug, Clone)]
#[command(name = "meshsubd")]
#[command(about = "Brokerless cluster pub/sub node with unique acknowledgement labels")]
pub struct Config {
    /// Human-readable node name; the node id is derived from it per start
    #[arg(long, env = "MESHSUB_NODE_NAME", default_value = "meshsub")]
    pub node_name: String,

    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9200")]
    pub listen: SocketAddr,

    /// Seed nodes (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub seeds: Vec<SocketAddr>,

    /// Gossip round interval in milliseconds
    #[arg(long, default_value = "500")]
    pub gossip_interval_ms: u64,

    /// Bound on subscribe/declare requests in seconds
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,

    /// How long an unreachable node is kept before its entries are purged
    #[arg(long, default_value = "10")]
    pub removal_margin_secs: u64,

    /// Tombstones retained per origin before compaction
    #[arg(long, default_value = "1024")]
    pub max_tombstones: usize,

    /// Run without the acknowledgement label registry
    #[arg(long)]
    pub disable_acks: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("Node name cannot be empty");
        }
        if self.gossip_interval_ms == 0 {
            anyhow::bail!("Gossip interval must be positive");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("Request timeout must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    /// Runtime settings for the node
    pub fn node_settings(&self) -> NodeSettings {
        NodeSettings {
            name: self.node_name.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            removal_margin: Duration::from_secs(self.removal_margin_secs),
            max_tombstones: self.max_tombstones,
            acks_enabled: !self.disable_acks,
        }
    }
}

/// Settings of a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub name: String,
    pub gossip_interval: Duration,
    pub request_timeout: Duration,
    pub removal_margin: Duration,
    pub max_tombstones: usize,
    pub acks_enabled: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: "meshsub".to_string(),
            gossip_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            removal_margin: Duration::from_secs(10),
            max_tombstones: 1024,
            acks_enabled: true,
        }
    }
}
