//! Error types for arbor-overlay.

use thiserror::Error;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while a node handles a message, timeout or command.
///
/// A returned error never leaves the node's routing table half-updated: the
/// offending message is dropped and the node keeps running.
#[derive(Debug, Error)]
pub enum Error {
    /// Message/state combination that cannot happen under the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A forwarded Find-End request exceeded the hop ceiling.
    #[error("hop limit exceeded after {hops} hops")]
    HopLimitExceeded { hops: u16 },

    /// Invalid configuration or endpoint.
    #[error("configuration error: {0}")]
    Config(String),

    /// Position arithmetic failed.
    #[error("tree error: {0}")]
    Tree(#[from] arbor_tree::TreeError),

    /// Wire encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The node has no position or has already left.
    #[error("node is not running")]
    NotRunning,

    /// A procedure of the same kind is already open on this node.
    #[error("node busy: {0}")]
    Busy(&'static str),
}

impl Error {
    pub(crate) fn violation(what: impl Into<String>) -> Self {
        Error::ProtocolViolation(what.into())
    }
}
