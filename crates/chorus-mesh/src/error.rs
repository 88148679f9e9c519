//! Error types for chorus-mesh.

use thiserror::Error;

/// Result type for chorus-mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The live peer count is already at the configured ceiling.
    #[error("peer capacity exceeded: {live}/{max} live peers")]
    CapacityExceeded { live: usize, max: usize },

    /// A live link to this peer already exists.
    #[error("already connected to peer {0}")]
    AlreadyConnected(String),

    /// The local node cannot peer with itself.
    #[error("refusing to connect to own id {0}")]
    SelfConnection(String),

    /// No live link to this peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// No pending inbound connection from this peer.
    #[error("no pending inbound connection from {0}")]
    NotPending(String),

    /// Too many unanswered inbound connection attempts.
    #[error("pending inbound queue full ({0} entries)")]
    PendingInboundFull(usize),

    /// Too many queued signals from one pending peer.
    #[error("pending signal queue for {peer_id} full ({max} entries)")]
    PendingSignalsFull { peer_id: String, max: usize },

    /// A metric was NaN or infinite.
    #[error("metric {0} must be finite")]
    InvalidMetric(&'static str),

    /// Transport failure on a single peer.
    #[error("connection error on peer {peer_id}: {reason}")]
    Connection { peer_id: String, reason: String },

    /// Inbound bytes that could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}
