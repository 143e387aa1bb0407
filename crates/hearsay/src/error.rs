//! Gossip error types

use thiserror::Error;

/// Result type for gossip operations
pub type Result<T> = std::result::Result<T, GossipError>;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no seed addresses configured")]
    NoSeeds,

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown node status: {0}")]
    UnknownStatus(String),

    #[error("command already registered: {0}")]
    DuplicateRegistration(String),

    // ==================== Lifecycle Errors ====================
    #[error("gossip engine already started")]
    AlreadyStarted,

    #[error("gossip engine not started")]
    NotStarted,

    // ==================== Network Errors ====================
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,
}

impl GossipError {
    /// Check if this error came from parsing a single inbound datagram.
    /// Parse errors discard the datagram and never affect membership state.
    pub fn is_parse(&self) -> bool {
        matches!(
            self,
            GossipError::Protocol(_) | GossipError::UnknownStatus(_)
        )
    }

    /// Check if this is a fatal error requiring shutdown
    pub fn is_fatal(&self) -> bool {
        matches!(self, GossipError::DuplicateRegistration(_))
    }
}

// Conversion from channel errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GossipError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GossipError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for GossipError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        GossipError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errors() {
        assert!(GossipError::Protocol("bad frame".into()).is_parse());
        assert!(GossipError::UnknownStatus("DEAD".into()).is_parse());
        assert!(!GossipError::AlreadyStarted.is_parse());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(GossipError::DuplicateRegistration("ping".into()).is_fatal());
        assert!(!GossipError::Protocol("bad frame".into()).is_fatal());
        assert!(!GossipError::NotStarted.is_fatal());
    }
}
