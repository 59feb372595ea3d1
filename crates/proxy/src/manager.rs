//! Proxy manager over a cluster communicator

use std::any::{Any, TypeId};
use std::sync::Arc;

use concord_store::Serializer;
use concord_transport::{ClusterCommunicator, Envelope, HandlerError, handler_fn};
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::ProxyConfig;
use crate::dispatch::DispatchTable;
use crate::error::{ProxyError, ProxyResult};
use crate::factory::ProxyFactory;
use crate::interface::{ProxyInterface, ensure_interface, subject_for, validate};
use crate::service::ProxyService;

/// [`ProxyService`] serving interfaces on the local node's communicator.
pub struct ProxyManager {
    communicator: Arc<dyn ClusterCommunicator>,
    config: ProxyConfig,
    factories: DashMap<(TypeId, TypeId), Box<dyn Any + Send + Sync>>,
}

impl ProxyManager {
    /// Create a new proxy manager
    #[must_use]
    pub fn new(communicator: Arc<dyn ClusterCommunicator>, config: ProxyConfig) -> Self {
        Self {
            communicator,
            config,
            factories: DashMap::new(),
        }
    }
}

impl ProxyService for ProxyManager {
    fn register_proxy_service<I, Z>(&self, implementation: Arc<I>, serializer: Z) -> ProxyResult<()>
    where
        I: ProxyInterface + ?Sized,
        Z: Serializer,
    {
        let mut table = DispatchTable::new(I::NAME, serializer);
        I::register_methods(implementation, &mut table);
        validate::<I, Z>(&table)?;

        let table = Arc::new(table);
        self.communicator.add_subscriber(
            &subject_for::<I>(),
            handler_fn(move |envelope: Envelope| {
                let table = Arc::clone(&table);
                async move {
                    table
                        .dispatch(&envelope.payload)
                        .await
                        .map_err(HandlerError::new)
                }
            }),
        );

        info!(
            "Serving proxy interface '{}' on {}",
            I::NAME,
            self.communicator.local_node_id()
        );
        Ok(())
    }

    fn unregister_proxy_service<I>(&self)
    where
        I: ProxyInterface + ?Sized,
    {
        self.communicator.remove_subscriber(&subject_for::<I>());
        info!(
            "Stopped serving proxy interface '{}' on {}",
            I::NAME,
            self.communicator.local_node_id()
        );
    }

    fn get_proxy_factory<I, Z>(&self, serializer: Z) -> ProxyResult<ProxyFactory<I, Z>>
    where
        I: ProxyInterface + ?Sized,
        Z: Serializer,
    {
        ensure_interface::<I>()?;
        let runtime = Handle::try_current().map_err(|_| ProxyError::NoRuntime)?;

        let build = || {
            ProxyFactory::<I, Z>::new(
                Arc::clone(&self.communicator),
                serializer.clone(),
                self.config.timeout,
                runtime.clone(),
            )
        };

        let entry = self
            .factories
            .entry((TypeId::of::<I>(), TypeId::of::<Z>()))
            .or_insert_with(|| Box::new(build()));

        Ok(entry
            .value()
            .as_ref()
            .downcast_ref::<ProxyFactory<I, Z>>()
            .cloned()
            .unwrap_or_else(build))
    }
}
