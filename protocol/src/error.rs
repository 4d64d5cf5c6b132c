use crate::types::NodeIdentifier;

/// Errors raised by the neighbor protocol and the node execution loop.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The byte stream no longer lines up with message boundaries. The
    /// link that produced it must be torn down.
    #[error("stream out of sync: {0}")]
    StreamOutOfSync(String),

    #[error("link I/O error: {0}")]
    LinkIo(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("no address known for node {0}")]
    UnknownNode(NodeIdentifier),

    #[error("dialed {expected} but peer announced itself as {actual}")]
    HandshakeMismatch {
        expected: NodeIdentifier,
        actual: NodeIdentifier,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The computation kernel failed; the owning node's loop stops.
    #[error("kernel failed: {0}")]
    Kernel(String),
}

impl ProtocolError {
    /// True when the error came from the peer closing or breaking the
    /// connection rather than from bad bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, ProtocolError::LinkIo(_))
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
