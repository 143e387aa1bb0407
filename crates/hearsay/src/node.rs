//! Node facts and the rule that orders conflicting facts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Unique node identifier (UUID or human-readable string)
pub type NodeId = String;

/// Believed liveness of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Node is responding to probes
    Alive,
    /// Node missed a probe round, not yet confirmed failed
    Suspected,
    /// Node confirmed failed (terminal)
    Failed,
    /// No status asserted; a sender omitting the status field implies ALIVE
    Unknown,
}

impl NodeStatus {
    /// Wire literal for this status
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Alive => "ALIVE",
            NodeStatus::Suspected => "SUSPECTED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire literal. Unrecognized input yields `Unknown`,
    /// which the codec reports as a parse error.
    pub fn from_wire(token: &[u8]) -> NodeStatus {
        match token {
            b"ALIVE" => NodeStatus::Alive,
            b"SUSPECTED" => NodeStatus::Suspected,
            b"FAILED" => NodeStatus::Failed,
            _ => NodeStatus::Unknown,
        }
    }

    /// Check if a node in this status might still answer a probe
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeStatus::Alive | NodeStatus::Suspected)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A membership fact about one node.
///
/// Identity is `id`; `(addr, version, status)` is the mutable fact about that
/// identity. Nodes are value types copied freely; updates always produce a
/// new `Node` that replaces the old one under [`Node::supersedes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    pub id: NodeId,

    /// Gossip address of the node
    pub addr: SocketAddr,

    /// Incarnation number disambiguating successive facts about this id
    pub version: u64,

    /// Believed liveness
    pub status: NodeStatus,
}

impl Node {
    /// Create a new ALIVE fact
    pub fn new(id: impl Into<NodeId>, addr: SocketAddr, version: u64) -> Self {
        Self {
            id: id.into(),
            addr,
            version,
            status: NodeStatus::Alive,
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    /// Decide whether this fact (the candidate) should replace `incumbent`,
    /// an existing fact about the same id.
    ///
    /// FAILED always wins over live or suspected facts regardless of version:
    /// death is terminal and not subject to version races. SUSPECTED beats
    /// ALIVE at equal version, so ties favor distrust. A strictly higher
    /// version is required to move within the same status or to reassert
    /// ALIVE over suspicion.
    pub fn supersedes(&self, incumbent: &Node) -> bool {
        debug_assert_eq!(self.id, incumbent.id);

        match self.status {
            NodeStatus::Alive => {
                incumbent.status.is_reachable() && self.version > incumbent.version
            }
            NodeStatus::Suspected => {
                (incumbent.status == NodeStatus::Suspected && self.version > incumbent.version)
                    || (incumbent.status == NodeStatus::Alive
                        && self.version >= incumbent.version)
            }
            NodeStatus::Failed => incumbent.status.is_reachable(),
            // Unknown never reaches the merge path: the codec rejects
            // unrecognized literals and defaults an absent field to ALIVE.
            NodeStatus::Unknown => {
                debug_assert!(false, "UNKNOWN fact in merge path");
                false
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} v{} {}",
            self.id, self.addr, self.version, self.status
        )
    }
}
