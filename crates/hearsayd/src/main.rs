//! Hearsay membership daemon
//!
//! Usage:
//!   # First node
//!   hearsayd --bind 0.0.0.0:7946
//!
//!   # Joining nodes
//!   hearsayd --bind 0.0.0.0:7946 --node-id node-2 --seeds 10.0.0.1:7946
//!
//!   # With custom tuning
//!   hearsayd --bind 0.0.0.0:7946 \
//!     --node-id node-1 \
//!     --lambda 2.5 \
//!     --max-rumors 8 \
//!     --probe-interval-ms 500

use clap::Parser;
use hearsay::{Gossip, GossipConfig, MembershipEvent};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hearsay - decentralized cluster membership over UDP
#[derive(Parser, Debug)]
#[command(name = "hearsayd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// UDP bind address
    #[arg(short, long, default_value = "0.0.0.0:7946", env = "HEARSAY_BIND")]
    bind: SocketAddr,

    /// Advertised address (for NAT/container environments)
    #[arg(long, env = "HEARSAY_ADVERTISE")]
    advertise: Option<SocketAddr>,

    /// Unique node identifier (a random UUID when omitted)
    #[arg(long, env = "HEARSAY_NODE_ID")]
    node_id: Option<String>,

    /// Seed addresses to join (comma-separated)
    #[arg(long, value_delimiter = ',', env = "HEARSAY_SEEDS")]
    seeds: Vec<SocketAddr>,

    /// Receive buffer size in bytes
    #[arg(long, default_value = "65536", env = "HEARSAY_RECV_BUFFER")]
    recv_buffer_size: usize,

    /// Spread-round multiplier for rumor dissemination
    #[arg(long, default_value = "3.0", env = "HEARSAY_LAMBDA")]
    lambda: f64,

    /// Maximum rumors piggybacked per message
    #[arg(long, default_value = "10", env = "HEARSAY_MAX_RUMORS")]
    max_rumors: usize,

    /// Probe interval in milliseconds
    #[arg(long, default_value = "1000", env = "HEARSAY_PROBE_INTERVAL_MS")]
    probe_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

impl Cli {
    fn to_config(&self) -> GossipConfig {
        let mut builder = GossipConfig::builder()
            .bind_addr(self.bind)
            .recv_buffer_size(self.recv_buffer_size)
            .lambda(self.lambda)
            .max_rumors_per_message(self.max_rumors)
            .probe_interval(Duration::from_millis(self.probe_interval_ms))
            .seeds(self.seeds.clone());

        if let Some(node_id) = &self.node_id {
            builder = builder.node_id(node_id.clone());
        }
        if let Some(advertise) = self.advertise {
            builder = builder.advertise_addr(advertise);
        }

        builder.build()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let gossip = Gossip::new(cli.to_config())?;
    let addr = gossip.start().await?;
    tracing::info!(node_id = %gossip.node_id(), %addr, "hearsayd running");

    let mut events = gossip.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MembershipEvent::Joined(node)) => {
                    tracing::info!(node = %node, "member joined");
                }
                Ok(MembershipEvent::Suspected(id)) => {
                    tracing::warn!(node = %id, "member suspected");
                }
                Ok(MembershipEvent::Recovered(id)) => {
                    tracing::info!(node = %id, "member recovered");
                }
                Ok(MembershipEvent::Failed(id)) => {
                    tracing::warn!(node = %id, "member failed");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "membership event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping");

    gossip.stop().await?;
    event_log.abort();

    tracing::info!("goodbye");
    Ok(())
}
