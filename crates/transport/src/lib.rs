//! Node-addressed messaging between cluster members.
//!
//! This crate defines the interface coordination services use to talk to a
//! specific peer. The physical transport lives in separate crates.
//!
//! Communicators provide:
//! - One-way delivery to a node (`unicast`)
//! - Request/response with a deadline (`send_and_receive`)
//! - At most one subscriber per subject on each node
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use concord_identifiers::NodeId;
use tracing::warn;
use uuid::Uuid;

pub use error::{HandlerError, TransportError};

/// A message as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Correlation ID, present when the sender awaits a reply
    pub correlation_id: Option<Uuid>,
    /// Subject the message was addressed to
    pub subject: String,
    /// Opaque payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: NodeId,
}

impl Envelope {
    /// Whether the sender is waiting for a reply.
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        self.correlation_id.is_some()
    }
}

/// Handles messages addressed to one subject.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process a message. The returned bytes are sent back to the sender when
    /// it awaits a reply and dropped otherwise.
    async fn handle(&self, envelope: Envelope) -> Result<Bytes, HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<Bytes, HandlerError> {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Messaging endpoint of the local node.
#[async_trait]
pub trait ClusterCommunicator: Send + Sync + 'static {
    /// Identity of the local node.
    fn local_node_id(&self) -> &NodeId;

    /// Deliver a message without waiting for the handler to run.
    async fn unicast(&self, subject: &str, payload: Bytes, to: &NodeId)
    -> Result<(), TransportError>;

    /// Deliver a message to each node, logging (not failing on) unreachable
    /// destinations.
    async fn multicast(&self, subject: &str, payload: Bytes, to: &[NodeId]) {
        for node in to {
            if let Err(e) = self.unicast(subject, payload.clone(), node).await {
                warn!("Failed to deliver '{}' to {}: {}", subject, node, e);
            }
        }
    }

    /// Send a request and wait up to `timeout` for the reply.
    async fn send_and_receive(
        &self,
        subject: &str,
        payload: Bytes,
        to: &NodeId,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Register the handler for `subject`, replacing any existing one.
    fn add_subscriber(&self, subject: &str, handler: Arc<dyn MessageHandler>);

    /// Remove the handler for `subject`. Later messages fail with
    /// [`TransportError::NoHandler`].
    fn remove_subscriber(&self, subject: &str);
}
