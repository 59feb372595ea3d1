//! Interfaces that can be served to and called from remote nodes

use std::collections::HashSet;
use std::sync::Arc;

use concord_store::Serializer;

use crate::dispatch::DispatchTable;
use crate::error::ProxyError;
use crate::invoker::RemoteInvoker;

/// How a proxy method returns to its caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MethodKind {
    /// The proxy returns a future resolved by the reply.
    Async,
    /// The proxy blocks the calling thread until the reply arrives.
    Blocking,
}

/// Declaration of one method of a [`ProxyInterface`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// Name the method is dispatched under
    pub name: &'static str,
    /// Calling convention of the method
    pub kind: MethodKind,
}

impl MethodDescriptor {
    /// Declare an async method.
    #[must_use]
    pub const fn asynchronous(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::Async,
        }
    }

    /// Declare a blocking method.
    #[must_use]
    pub const fn blocking(name: &'static str) -> Self {
        Self {
            name,
            kind: MethodKind::Blocking,
        }
    }
}

/// A service interface that can be exposed through the proxy layer.
///
/// Implemented for trait objects, e.g. `impl ProxyInterface for dyn Counter`,
/// so implementations and proxies are interchangeable behind an
/// `Arc<dyn Counter>`.
///
/// Method tables are declared as constants:
///
/// ```ignore
/// fn methods() -> &'static [MethodDescriptor] {
///     const METHODS: &[MethodDescriptor] = &[
///         MethodDescriptor::asynchronous("add"),
///         MethodDescriptor::blocking("total"),
///     ];
///     METHODS
/// }
/// ```
pub trait ProxyInterface: Send + Sync + 'static {
    /// Name shared by every node serving the interface.
    const NAME: &'static str;

    /// Every method of the interface.
    fn methods() -> &'static [MethodDescriptor];

    /// Route each declared method to `implementation`.
    fn register_methods<Z: Serializer>(implementation: Arc<Self>, table: &mut DispatchTable<Z>);

    /// Build a proxy forwarding every method through `invoker`.
    fn create_proxy<Z: Serializer>(invoker: RemoteInvoker<Z>) -> Arc<Self>;
}

/// Subject the interface is served on.
pub(crate) fn subject_for<I: ProxyInterface + ?Sized>() -> String {
    format!("proxy-service-{}", I::NAME)
}

/// Check that `I` is a trait object rather than a concrete type.
pub(crate) fn ensure_interface<I: ProxyInterface + ?Sized>() -> Result<(), ProxyError> {
    let type_name = std::any::type_name::<I>();
    if type_name.starts_with("dyn ") {
        Ok(())
    } else {
        Err(ProxyError::InvalidInterface {
            interface: I::NAME,
            reason: format!("{type_name} is not a trait object"),
        })
    }
}

/// Check that `table` serves exactly what `I` declares.
pub(crate) fn validate<I, Z>(table: &DispatchTable<Z>) -> Result<(), ProxyError>
where
    I: ProxyInterface + ?Sized,
    Z: Serializer,
{
    ensure_interface::<I>()?;

    let invalid = |reason: String| ProxyError::InvalidInterface {
        interface: I::NAME,
        reason,
    };

    if I::NAME.is_empty() || I::NAME.contains(char::is_whitespace) {
        return Err(invalid("name must be non-empty without whitespace".to_string()));
    }

    let declared = I::methods();
    if declared.is_empty() {
        return Err(invalid("no methods declared".to_string()));
    }

    let mut seen = HashSet::new();
    for method in declared {
        if !seen.insert(method.name) {
            return Err(invalid(format!("method '{}' declared twice", method.name)));
        }
        match table.kind_of(method.name) {
            None => return Err(invalid(format!("method '{}' has no handler", method.name))),
            Some(kind) if kind != method.kind => {
                return Err(invalid(format!(
                    "method '{}' declared {:?} but registered {:?}",
                    method.name, method.kind, kind
                )));
            }
            Some(_) => {}
        }
    }

    if let Some(extra) = table.method_names().find(|name| !seen.contains(name)) {
        return Err(invalid(format!("method '{extra}' is not declared")));
    }

    Ok(())
}
