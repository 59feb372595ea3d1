//! In-memory cluster messaging for tests
//!
//! Routes messages between communicators living in the same process. Each
//! node owns an inbox; a background task per node drains it and dispatches to
//! the subscribed handlers.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use concord_identifiers::NodeId;
use concord_transport::{ClusterCommunicator, Envelope, MessageHandler, TransportError};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingReplies = DashMap<Uuid, oneshot::Sender<Result<Bytes, TransportError>>>;

/// Configuration for memory communicators
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Number of frames buffered per inbox before senders wait
    pub inbox_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
        }
    }
}

enum Frame {
    Message(Envelope),
    Reply {
        correlation_id: Uuid,
        result: Result<Bytes, TransportError>,
    },
}

/// Registry of connected nodes, shared by every communicator on the network
#[derive(Default)]
pub struct MemoryNetwork {
    inboxes: DashMap<NodeId, flume::Sender<Frame>>,
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("nodes", &self.inboxes.len())
            .finish()
    }
}

impl MemoryNetwork {
    /// Create an empty network
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a node with default options
    ///
    /// Must be called from within a tokio runtime.
    pub fn join(self: &Arc<Self>, node_id: NodeId) -> Arc<MemoryCommunicator> {
        self.join_with_options(node_id, MemoryOptions::default())
    }

    /// Connect a node, replacing any earlier endpoint with the same id
    ///
    /// Must be called from within a tokio runtime.
    pub fn join_with_options(
        self: &Arc<Self>,
        node_id: NodeId,
        options: MemoryOptions,
    ) -> Arc<MemoryCommunicator> {
        let (inbox_tx, inbox_rx) = flume::bounded(options.inbox_capacity);

        let subscribers: Arc<DashMap<String, Arc<dyn MessageHandler>>> = Arc::new(DashMap::new());
        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());

        let receive_task = tokio::spawn(receive_loop(
            node_id.clone(),
            inbox_rx,
            self.clone(),
            subscribers.clone(),
            pending.clone(),
        ));

        self.inboxes.insert(node_id.clone(), inbox_tx);
        info!("Memory node {} joined network", node_id);

        Arc::new(MemoryCommunicator {
            node_id,
            network: self.clone(),
            subscribers,
            pending,
            receive_task,
        })
    }

    /// Disconnect a node, simulating a crash or partition
    ///
    /// Its inbox closes, messages addressed to it fail as unreachable and
    /// its own sends fail as closed.
    pub fn disconnect(&self, node_id: &NodeId) {
        if self.inboxes.remove(node_id).is_some() {
            info!("Memory node {} left network", node_id);
        }
    }

    /// Whether a node is currently connected
    #[must_use]
    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.inboxes.contains_key(node_id)
    }

    async fn deliver(&self, to: &NodeId, frame: Frame) -> Result<(), TransportError> {
        // Clone the sender so no map guard is held across the await.
        let inbox = self
            .inboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        inbox
            .send_async(frame)
            .await
            .map_err(|_| TransportError::Unreachable(to.clone()))
    }
}

async fn receive_loop(
    node_id: NodeId,
    inbox: flume::Receiver<Frame>,
    network: Arc<MemoryNetwork>,
    subscribers: Arc<DashMap<String, Arc<dyn MessageHandler>>>,
    pending: Arc<PendingReplies>,
) {
    while let Ok(frame) = inbox.recv_async().await {
        match frame {
            Frame::Reply {
                correlation_id,
                result,
            } => {
                if let Some((_, reply_tx)) = pending.remove(&correlation_id) {
                    let _ = reply_tx.send(result);
                } else {
                    debug!(
                        "Node {} dropping late reply {}",
                        node_id, correlation_id
                    );
                }
            }
            Frame::Message(envelope) => {
                let handler = subscribers
                    .get(&envelope.subject)
                    .map(|entry| entry.value().clone());

                match (handler, envelope.correlation_id) {
                    (Some(handler), None) => {
                        if let Err(e) = handler.handle(envelope.clone()).await {
                            warn!(
                                "Handler for '{}' on {} failed: {}",
                                envelope.subject, node_id, e
                            );
                        }
                    }
                    (Some(handler), Some(correlation_id)) => {
                        // Requests run concurrently so a handler may itself
                        // issue requests without stalling the inbox.
                        let network = network.clone();
                        tokio::spawn(async move {
                            let sender = envelope.sender.clone();
                            let result = handler.handle(envelope).await.map_err(Into::into);
                            let reply = Frame::Reply {
                                correlation_id,
                                result,
                            };
                            if let Err(e) = network.deliver(&sender, reply).await {
                                debug!("Could not return reply to {}: {}", sender, e);
                            }
                        });
                    }
                    (None, Some(correlation_id)) => {
                        let reply = Frame::Reply {
                            correlation_id,
                            result: Err(TransportError::NoHandler {
                                node: node_id.clone(),
                                subject: envelope.subject.clone(),
                            }),
                        };
                        let _ = network.deliver(&envelope.sender, reply).await;
                    }
                    (None, None) => {
                        debug!(
                            "Node {} has no handler for '{}', dropping message",
                            node_id, envelope.subject
                        );
                    }
                }
            }
        }
    }

    // Fail outstanding requests once the inbox is gone.
    pending.retain(|_, _| false);
    debug!("Receive loop for {} exited", node_id);
}

/// Messaging endpoint of one node on a [`MemoryNetwork`]
pub struct MemoryCommunicator {
    node_id: NodeId,
    network: Arc<MemoryNetwork>,
    subscribers: Arc<DashMap<String, Arc<dyn MessageHandler>>>,
    pending: Arc<PendingReplies>,
    receive_task: JoinHandle<()>,
}

impl Debug for MemoryCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCommunicator")
            .field("node_id", &self.node_id)
            .field("subjects", &self.subscribers.len())
            .finish()
    }
}

impl MemoryCommunicator {
    /// Disconnect this node from its network
    pub fn close(&self) {
        self.network.disconnect(&self.node_id);
    }
}

impl Drop for MemoryCommunicator {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

#[async_trait]
impl ClusterCommunicator for MemoryCommunicator {
    fn local_node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn unicast(
        &self,
        subject: &str,
        payload: Bytes,
        to: &NodeId,
    ) -> Result<(), TransportError> {
        if !self.network.is_connected(&self.node_id) {
            return Err(TransportError::Closed);
        }

        debug!(
            "Node {} sending {} bytes on '{}' to {}",
            self.node_id,
            payload.len(),
            subject,
            to
        );

        let envelope = Envelope {
            correlation_id: None,
            subject: subject.to_string(),
            payload,
            sender: self.node_id.clone(),
        };
        self.network.deliver(to, Frame::Message(envelope)).await
    }

    async fn send_and_receive(
        &self,
        subject: &str,
        payload: Bytes,
        to: &NodeId,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        if !self.network.is_connected(&self.node_id) {
            return Err(TransportError::Closed);
        }

        let correlation_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(correlation_id, reply_tx);

        let envelope = Envelope {
            correlation_id: Some(correlation_id),
            subject: subject.to_string(),
            payload,
            sender: self.node_id.clone(),
        };

        if let Err(e) = self.network.deliver(to, Frame::Message(envelope)).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    fn add_subscriber(&self, subject: &str, handler: Arc<dyn MessageHandler>) {
        debug!("Node {} subscribing to '{}'", self.node_id, subject);
        self.subscribers.insert(subject.to_string(), handler);
    }

    fn remove_subscriber(&self, subject: &str) {
        debug!("Node {} unsubscribing from '{}'", self.node_id, subject);
        self.subscribers.remove(subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use concord_transport::handler_fn;

    fn node(id: &str) -> NodeId {
        NodeId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_join_registers_inbox() {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let communicator = network.join(node("a"));

        assert!(network.is_connected(&node("a")));
        communicator.close();
        assert!(!network.is_connected(&node("a")));
    }

    #[tokio::test]
    async fn test_request_to_unknown_node_is_unreachable() {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let a = network.join(node("a"));

        let result = a
            .send_and_receive("ping", Bytes::new(), &node("b"), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(TransportError::Unreachable(node("b"))));
    }

    #[tokio::test]
    async fn test_request_without_subscriber_reports_no_handler() {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let a = network.join(node("a"));
        let _b = network.join(node("b"));

        let result = a
            .send_and_receive("ping", Bytes::new(), &node("b"), Duration::from_secs(1))
            .await;
        assert_eq!(
            result,
            Err(TransportError::NoHandler {
                node: node("b"),
                subject: "ping".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_subscriber_replacement() {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let a = network.join(node("a"));
        let b = network.join(node("b"));

        b.add_subscriber(
            "who",
            handler_fn(|_| async { Ok(Bytes::from_static(b"first")) }),
        );
        b.add_subscriber(
            "who",
            handler_fn(|_| async { Ok(Bytes::from_static(b"second")) }),
        );

        let reply = a
            .send_and_receive("who", Bytes::new(), &node("b"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"second"));
    }
}
