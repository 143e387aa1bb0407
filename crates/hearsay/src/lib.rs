//! # Hearsay
//!
//! Decentralized cluster membership and failure detection in the style of
//! SWIM: nodes exchange periodic probes over UDP, piggyback membership
//! changes ("rumors") on those probes, and converge on a shared view of
//! which peers are alive, suspected, or failed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Gossip Engine                         │
//! ├───────────────┬───────────────┬─────────────────────────────┤
//! │  Member Set   │ Rumor Buffer  │       Task Scheduler        │
//! ├───────────────┼───────────────┼─────────────────────────────┤
//! │ • round-robin │ • spread      │ • ping → ping-req → ack     │
//! │   sampling    │   counters    │   correlation               │
//! │ • merge rule  │ • stabilize   │ • timeout sweep &           │
//! │   arbitration │   or drop     │   suspicion escalation      │
//! └───────────────┴───────────────┴─────────────────────────────┘
//!         ▲                                     │
//!         │ wire codec (framed tokens)          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              UDP transport (inbox / outbox)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All membership state is confined to the engine's worker task; the only
//! cross-thread boundary is the outbound send channel into the transport.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use hearsay::{Gossip, GossipConfig};
//!
//! let config = GossipConfig::builder()
//!     .node_id("node-1")
//!     .bind_addr("0.0.0.0:7946".parse()?)
//!     .seeds(vec!["10.0.0.2:7946".parse()?])
//!     .build();
//!
//! let gossip = Gossip::new(config)?;
//! gossip.start().await?;
//!
//! let mut events = gossip.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("membership changed: {:?}", event);
//! }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod member_set;
pub mod node;
pub mod rumor;
pub mod scheduler;
pub mod transport;

// Re-export main types
pub use config::{GossipConfig, GossipConfigBuilder};
pub use engine::{Gossip, MembershipEvent};
pub use error::{GossipError, Result};
pub use member_set::MemberSet;
pub use node::{Node, NodeId, NodeStatus};
pub use rumor::RumorBuffer;
pub use scheduler::{Task, TaskScheduler};
pub use transport::UdpTransport;
