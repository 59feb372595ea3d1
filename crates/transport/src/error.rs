//! Error types for cluster messaging.

use std::time::Duration;

use concord_identifiers::NodeId;
use thiserror::Error;

/// Errors raised while exchanging messages with cluster peers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// The destination is not connected.
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    /// No reply arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The destination has no subscriber for the subject.
    #[error("node {node} has no handler for '{subject}'")]
    NoHandler {
        /// Destination node.
        node: NodeId,
        /// Subject that was addressed.
        subject: String,
    },

    /// The remote handler failed.
    #[error("remote handler failed: {0}")]
    Handler(String),

    /// The local endpoint has shut down.
    #[error("communicator closed")]
    Closed,
}

/// Failure reported by a [`MessageHandler`](crate::MessageHandler).
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Build a handler error from anything printable.
    pub fn new(message: impl ToString) -> Self {
        Self(message.to_string())
    }
}

impl From<HandlerError> for TransportError {
    fn from(error: HandlerError) -> Self {
        Self::Handler(error.0)
    }
}
