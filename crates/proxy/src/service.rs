//! Proxy service interface

use std::sync::Arc;

use concord_store::Serializer;

use crate::error::ProxyResult;
use crate::factory::ProxyFactory;
use crate::interface::ProxyInterface;

/// Serves local implementations to peers and builds proxies to theirs.
pub trait ProxyService: Send + Sync + 'static {
    /// Serve `implementation` as the local provider of `I`, replacing any
    /// earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidInterface`](crate::ProxyError::InvalidInterface)
    /// if `I` is not a trait object or the methods it routes do not match the
    /// methods it declares.
    fn register_proxy_service<I, Z>(&self, implementation: Arc<I>, serializer: Z) -> ProxyResult<()>
    where
        I: ProxyInterface + ?Sized,
        Z: Serializer;

    /// Stop serving `I`. Later calls from peers fail.
    fn unregister_proxy_service<I>(&self)
    where
        I: ProxyInterface + ?Sized;

    /// Factory of proxies of `I` on other nodes, encoding calls with
    /// `serializer`.
    ///
    /// Proxies drive blocking calls from plain threads on the runtime the
    /// factory was created in.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidInterface`](crate::ProxyError::InvalidInterface)
    /// if `I` is not a trait object, and
    /// [`ProxyError::NoRuntime`](crate::ProxyError::NoRuntime) outside a tokio
    /// runtime.
    fn get_proxy_factory<I, Z>(&self, serializer: Z) -> ProxyResult<ProxyFactory<I, Z>>
    where
        I: ProxyInterface + ?Sized,
        Z: Serializer;
}
