//! Client side of proxied calls

use std::sync::Arc;
use std::time::Duration;

use concord_identifiers::NodeId;
use concord_store::Serializer;
use concord_transport::ClusterCommunicator;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::debug;

use crate::dispatch::ProxyRequest;
use crate::error::{ProxyError, ProxyResult};

/// Sends calls of one interface to one node.
///
/// Proxies hold an invoker and forward each method through it.
pub struct RemoteInvoker<Z> {
    communicator: Arc<dyn ClusterCommunicator>,
    target: NodeId,
    subject: Arc<str>,
    serializer: Z,
    timeout: Duration,
    runtime: Handle,
}

impl<Z: Clone> Clone for RemoteInvoker<Z> {
    fn clone(&self) -> Self {
        Self {
            communicator: Arc::clone(&self.communicator),
            target: self.target.clone(),
            subject: Arc::clone(&self.subject),
            serializer: self.serializer.clone(),
            timeout: self.timeout,
            runtime: self.runtime.clone(),
        }
    }
}

impl<Z: Serializer> RemoteInvoker<Z> {
    pub(crate) fn new(
        communicator: Arc<dyn ClusterCommunicator>,
        target: NodeId,
        subject: Arc<str>,
        serializer: Z,
        timeout: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            communicator,
            target,
            subject,
            serializer,
            timeout,
            runtime,
        }
    }

    /// Node the calls go to.
    #[must_use]
    pub const fn target(&self) -> &NodeId {
        &self.target
    }

    /// Call `method` on the target node and await its result.
    ///
    /// # Errors
    ///
    /// Fails on encoding errors, when the target is unreachable or silent
    /// past the timeout, and when the remote method fails.
    pub async fn invoke<A, R>(&self, method: &str, args: &A) -> ProxyResult<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let request = ProxyRequest {
            method: method.to_string(),
            args: self.serializer.encode(args)?.to_vec(),
        };
        let payload = self.serializer.encode(&request)?;

        debug!("Calling '{}' on {} via '{}'", method, self.target, self.subject);
        let reply = self
            .communicator
            .send_and_receive(&self.subject, payload, &self.target, self.timeout)
            .await?;

        Ok(self.serializer.decode(&reply)?)
    }

    /// Call `method` on the target node, blocking the current thread until
    /// the result arrives.
    ///
    /// Threads outside any runtime drive the call on the runtime the proxy
    /// was created in. Inside a multi-threaded runtime the call runs in place.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteInvoker::invoke`], plus
    /// [`ProxyError::BlockingUnsupported`] on a current-thread runtime, which
    /// cannot be blocked without stalling the reply.
    pub fn invoke_blocking<A, R>(&self, method: &str, args: &A) -> ProxyResult<R>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let Ok(current) = Handle::try_current() else {
            return self.runtime.block_on(self.invoke(method, args));
        };

        if current.runtime_flavor() != RuntimeFlavor::MultiThread {
            return Err(ProxyError::BlockingUnsupported);
        }

        tokio::task::block_in_place(|| current.block_on(self.invoke(method, args)))
    }
}
