//! Error types for proxy calls

use concord_store::CodecError;
use concord_transport::TransportError;
use thiserror::Error;

/// Errors raised while registering or calling proxied services.
#[derive(Clone, Debug, Error)]
pub enum ProxyError {
    /// The interface declaration does not match its registered methods.
    #[error("invalid proxy interface '{interface}': {reason}")]
    InvalidInterface {
        /// Name of the rejected interface
        interface: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The remote service has no such method.
    #[error("service '{service}' has no method '{method}'")]
    UnknownMethod {
        /// Service that was called
        service: String,
        /// Method that was requested
        method: String,
    },

    /// Arguments or results could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The request never got a reply.
    #[error(transparent)]
    Transport(TransportError),

    /// The remote side answered with a failure.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// Failure raised by a service implementation.
    #[error("{0}")]
    Failed(String),

    /// Proxies were requested outside a tokio runtime.
    #[error("proxy factories must be created inside a tokio runtime")]
    NoRuntime,

    /// A blocking call was made where the runtime cannot be blocked.
    #[error("blocking proxy calls cannot run on a current-thread tokio runtime")]
    BlockingUnsupported,
}

impl ProxyError {
    /// Build an implementation failure from anything printable.
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }
}

impl From<TransportError> for ProxyError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Handler(message) => Self::Remote(message),
            other => Self::Transport(other),
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
