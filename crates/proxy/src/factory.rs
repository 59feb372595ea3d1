//! Per-node proxies of one interface

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use concord_identifiers::NodeId;
use concord_store::Serializer;
use concord_transport::ClusterCommunicator;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::debug;

use crate::interface::{ProxyInterface, subject_for};
use crate::invoker::RemoteInvoker;

struct FactoryInner<I: ?Sized, Z> {
    communicator: Arc<dyn ClusterCommunicator>,
    subject: Arc<str>,
    serializer: Z,
    timeout: Duration,
    runtime: Handle,
    proxies: DashMap<NodeId, Arc<I>>,
}

/// Hands out proxies of interface `I`, one per target node.
///
/// Clones share the same proxy cache.
pub struct ProxyFactory<I: ?Sized, Z> {
    inner: Arc<FactoryInner<I, Z>>,
}

impl<I: ?Sized, Z> Clone for ProxyFactory<I, Z> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: ProxyInterface + ?Sized, Z> Debug for ProxyFactory<I, Z> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyFactory")
            .field("interface", &I::NAME)
            .field("proxies", &self.inner.proxies.len())
            .finish()
    }
}

impl<I, Z> ProxyFactory<I, Z>
where
    I: ProxyInterface + ?Sized,
    Z: Serializer,
{
    pub(crate) fn new(
        communicator: Arc<dyn ClusterCommunicator>,
        serializer: Z,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                communicator,
                subject: Arc::from(subject_for::<I>()),
                serializer,
                timeout,
                runtime,
                proxies: DashMap::new(),
            }),
        }
    }

    /// Proxy of `I` served by `node`.
    ///
    /// Repeated calls for the same node return the same proxy.
    #[must_use]
    pub fn get_proxy_for(&self, node: &NodeId) -> Arc<I> {
        if let Some(proxy) = self.inner.proxies.get(node) {
            return Arc::clone(proxy.value());
        }

        let entry = self.inner.proxies.entry(node.clone()).or_insert_with(|| {
            debug!("Creating '{}' proxy for {}", I::NAME, node);
            I::create_proxy(RemoteInvoker::new(
                Arc::clone(&self.inner.communicator),
                node.clone(),
                Arc::clone(&self.inner.subject),
                self.inner.serializer.clone(),
                self.inner.timeout,
                self.inner.runtime.clone(),
            ))
        });
        Arc::clone(entry.value())
    }
}
