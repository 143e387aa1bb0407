//! Gossip engine configuration

use crate::error::{GossipError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Gossip engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Unique node identifier; a UUID is generated when absent
    pub node_id: Option<String>,

    /// UDP listen address
    pub bind_addr: SocketAddr,

    /// Advertised address (for NAT/container environments)
    pub advertise_addr: Option<SocketAddr>,

    /// Receive buffer size for inbound datagrams
    pub recv_buffer_size: usize,

    /// Spread-round multiplier: a fact is pushed
    /// `floor(lambda * ln(cluster size)) + 1` times before stabilizing
    pub lambda: f64,

    /// Maximum rumors piggybacked per outbound message
    pub max_rumors_per_message: usize,

    /// Interval between probe rounds (also drives the timeout sweep)
    pub probe_interval: Duration,

    /// Timeout for direct and indirect probes, and for ping-req relays
    pub task_timeout: Duration,

    /// How long a suspected node may stay silent before being declared
    /// failed
    pub suspicion_timeout: Duration,

    /// Number of peers asked to probe indirectly when a direct probe
    /// goes unanswered
    pub indirect_probes: usize,

    /// Seed addresses pinged at startup to join an existing cluster
    pub seeds: Vec<SocketAddr>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            advertise_addr: None,
            recv_buffer_size: 64 * 1024,
            lambda: 3.0,
            max_rumors_per_message: 10,
            probe_interval: Duration::from_secs(1),
            task_timeout: Duration::from_millis(500),
            suspicion_timeout: Duration::from_secs(4),
            indirect_probes: 3,
            seeds: Vec::new(),
        }
    }
}

impl GossipConfig {
    /// Create a configuration builder
    pub fn builder() -> GossipConfigBuilder {
        GossipConfigBuilder::default()
    }

    /// Get the address other nodes should use to reach this one
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.bind_addr)
    }

    /// Validate tuning parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.lambda > 0.0) {
            return Err(GossipError::InvalidConfig(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if self.max_rumors_per_message == 0 {
            return Err(GossipError::InvalidConfig(
                "max_rumors_per_message must be at least 1".into(),
            ));
        }
        if self.recv_buffer_size < 512 {
            return Err(GossipError::InvalidConfig(format!(
                "recv_buffer_size too small: {}",
                self.recv_buffer_size
            )));
        }
        if self.probe_interval.is_zero() || self.task_timeout.is_zero() {
            return Err(GossipError::InvalidConfig(
                "probe_interval and task_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for gossip configuration
#[derive(Debug, Default)]
pub struct GossipConfigBuilder {
    config: GossipConfig,
}

impl GossipConfigBuilder {
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.config.node_id = Some(id.into());
        self
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    pub fn advertise_addr(mut self, addr: SocketAddr) -> Self {
        self.config.advertise_addr = Some(addr);
        self
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    pub fn lambda(mut self, lambda: f64) -> Self {
        self.config.lambda = lambda;
        self
    }

    pub fn max_rumors_per_message(mut self, max: usize) -> Self {
        self.config.max_rumors_per_message = max;
        self
    }

    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = timeout;
        self
    }

    pub fn suspicion_timeout(mut self, timeout: Duration) -> Self {
        self.config.suspicion_timeout = timeout;
        self
    }

    pub fn indirect_probes(mut self, count: usize) -> Self {
        self.config.indirect_probes = count;
        self
    }

    pub fn seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.config.seeds = seeds;
        self
    }

    pub fn build(self) -> GossipConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.advertised_addr(), config.bind_addr);
    }

    #[test]
    fn test_builder() {
        let config = GossipConfig::builder()
            .node_id("node-1")
            .bind_addr("127.0.0.1:7946".parse().unwrap())
            .advertise_addr("10.0.0.1:7946".parse().unwrap())
            .lambda(2.0)
            .max_rumors_per_message(6)
            .seeds(vec!["127.0.0.1:7947".parse().unwrap()])
            .build();

        assert_eq!(config.node_id.as_deref(), Some("node-1"));
        assert_eq!(
            config.advertised_addr(),
            "10.0.0.1:7946".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.seeds.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_tuning_rejected() {
        let config = GossipConfig::builder().lambda(0.0).build();
        assert!(config.validate().is_err());

        let config = GossipConfig::builder().max_rumors_per_message(0).build();
        assert!(config.validate().is_err());

        let config = GossipConfig::builder().recv_buffer_size(16).build();
        assert!(config.validate().is_err());
    }
}
