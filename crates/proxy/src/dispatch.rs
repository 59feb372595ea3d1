//! Server side of proxied calls

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use concord_store::Serializer;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{ProxyError, ProxyResult};
use crate::interface::MethodKind;

/// A call as it travels to the serving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Method to run
    pub method: String,
    /// Encoded arguments
    #[serde(with = "serde_bytes")]
    pub args: Vec<u8>,
}

type Handler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, ProxyResult<Bytes>> + Send + Sync>;

struct Entry {
    kind: MethodKind,
    handler: Handler,
}

/// Method handlers of one served interface.
///
/// Arguments and results are encoded with the serializer the interface was
/// registered with; callers must use the same one.
pub struct DispatchTable<Z> {
    service: &'static str,
    serializer: Z,
    entries: HashMap<&'static str, Entry>,
}

impl<Z: Serializer> DispatchTable<Z> {
    /// Create an empty table for `service`.
    #[must_use]
    pub fn new(service: &'static str, serializer: Z) -> Self {
        Self {
            service,
            serializer,
            entries: HashMap::new(),
        }
    }

    /// Name of the served interface.
    #[must_use]
    pub const fn service(&self) -> &'static str {
        self.service
    }

    /// Route `method` to an async handler. Replaces any earlier handler.
    pub fn add<A, R, F, Fut>(&mut self, method: &'static str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProxyResult<R>> + Send + 'static,
    {
        let serializer = self.serializer.clone();
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args: Bytes| {
            let serializer = serializer.clone();
            let f = Arc::clone(&f);
            async move {
                let args: A = serializer.decode(&args)?;
                let result = f(args).await?;
                Ok(serializer.encode(&result)?)
            }
            .boxed()
        });

        self.entries.insert(
            method,
            Entry {
                kind: MethodKind::Async,
                handler,
            },
        );
        self
    }

    /// Route `method` to a synchronous handler, run on the blocking pool.
    /// Replaces any earlier handler.
    pub fn add_blocking<A, R, F>(&mut self, method: &'static str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> ProxyResult<R> + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args: Bytes| {
            let serializer = serializer.clone();
            let f = Arc::clone(&f);
            async move {
                let args: A = serializer.decode(&args)?;
                let result = tokio::task::spawn_blocking(move || f(args))
                    .await
                    .map_err(|e| ProxyError::failed(format!("handler panicked: {e}")))??;
                Ok(serializer.encode(&result)?)
            }
            .boxed()
        });

        self.entries.insert(
            method,
            Entry {
                kind: MethodKind::Blocking,
                handler,
            },
        );
        self
    }

    pub(crate) fn kind_of(&self, method: &str) -> Option<MethodKind> {
        self.entries.get(method).map(|entry| entry.kind)
    }

    pub(crate) fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Decode a request and run the method it names.
    ///
    /// # Errors
    ///
    /// Fails if the request cannot be decoded, names an unknown method, or
    /// the method itself fails.
    #[instrument(skip(self, payload), fields(service = self.service))]
    pub async fn dispatch(&self, payload: &[u8]) -> ProxyResult<Bytes> {
        let request: ProxyRequest = self.serializer.decode(payload)?;

        let Some(entry) = self.entries.get(request.method.as_str()) else {
            warn!("Unknown method '{}'", request.method);
            return Err(ProxyError::UnknownMethod {
                service: self.service.to_string(),
                method: request.method,
            });
        };

        debug!("Dispatching '{}' ({} argument bytes)", request.method, request.args.len());
        (entry.handler)(Bytes::from(request.args)).await
    }
}
