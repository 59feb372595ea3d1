use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use concord_identifiers::NodeId;
use concord_proxy::{
    DispatchTable, MethodDescriptor, ProxyConfig, ProxyError, ProxyInterface, ProxyManager,
    ProxyResult, ProxyService, RemoteInvoker,
};
use concord_store::{CborSerializer, JsonSerializer, Serializer};
use concord_transport::{ClusterCommunicator, TransportError};
use concord_transport_memory::MemoryNetwork;

#[async_trait]
trait Counter: Send + Sync {
    async fn add(&self, amount: u64) -> ProxyResult<u64>;

    fn total(&self) -> ProxyResult<u64>;
}

impl ProxyInterface for dyn Counter {
    const NAME: &'static str = "counter";

    fn methods() -> &'static [MethodDescriptor] {
        const METHODS: &[MethodDescriptor] = &[
            MethodDescriptor::asynchronous("add"),
            MethodDescriptor::blocking("total"),
        ];
        METHODS
    }

    fn register_methods<Z: Serializer>(implementation: Arc<Self>, table: &mut DispatchTable<Z>) {
        let counter = Arc::clone(&implementation);
        table
            .add("add", move |amount: u64| {
                let counter = Arc::clone(&counter);
                async move { counter.add(amount).await }
            })
            .add_blocking("total", move |(): ()| implementation.total());
    }

    fn create_proxy<Z: Serializer>(invoker: RemoteInvoker<Z>) -> Arc<Self> {
        Arc::new(CounterProxy { invoker })
    }
}

struct CounterProxy<Z> {
    invoker: RemoteInvoker<Z>,
}

#[async_trait]
impl<Z: Serializer> Counter for CounterProxy<Z> {
    async fn add(&self, amount: u64) -> ProxyResult<u64> {
        self.invoker.invoke("add", &amount).await
    }

    fn total(&self) -> ProxyResult<u64> {
        self.invoker.invoke_blocking("total", &())
    }
}

struct LocalCounter {
    total: AtomicU64,
    delay: Duration,
}

impl LocalCounter {
    fn starting_at(total: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            delay: Duration::ZERO,
        })
    }
}

#[async_trait]
impl Counter for LocalCounter {
    async fn add(&self, amount: u64) -> ProxyResult<u64> {
        if amount == 0 {
            return Err(ProxyError::failed("amount must be positive"));
        }
        tokio::time::sleep(self.delay).await;
        Ok(self.total.fetch_add(amount, Ordering::SeqCst) + amount)
    }

    fn total(&self) -> ProxyResult<u64> {
        Ok(self.total.load(Ordering::SeqCst))
    }
}

/// Declares a method it never routes.
trait Incomplete: Send + Sync {}

impl ProxyInterface for dyn Incomplete {
    const NAME: &'static str = "incomplete";

    fn methods() -> &'static [MethodDescriptor] {
        const METHODS: &[MethodDescriptor] = &[MethodDescriptor::asynchronous("missing")];
        METHODS
    }

    fn register_methods<Z: Serializer>(_implementation: Arc<Self>, _table: &mut DispatchTable<Z>) {}

    fn create_proxy<Z: Serializer>(_invoker: RemoteInvoker<Z>) -> Arc<Self> {
        Arc::new(Nothing)
    }
}

struct Nothing;

impl Incomplete for Nothing {}

/// A concrete type posing as an interface.
struct Standalone;

impl ProxyInterface for Standalone {
    const NAME: &'static str = "standalone";

    fn methods() -> &'static [MethodDescriptor] {
        const METHODS: &[MethodDescriptor] = &[MethodDescriptor::asynchronous("ping")];
        METHODS
    }

    fn register_methods<Z: Serializer>(_implementation: Arc<Self>, table: &mut DispatchTable<Z>) {
        table.add("ping", |(): ()| async move { Ok(()) });
    }

    fn create_proxy<Z: Serializer>(_invoker: RemoteInvoker<Z>) -> Arc<Self> {
        Arc::new(Self)
    }
}

fn node(id: &str) -> NodeId {
    NodeId::new(id).unwrap()
}

fn manager(network: &Arc<MemoryNetwork>, id: &str) -> ProxyManager {
    manager_with_timeout(network, id, ProxyConfig::default().timeout)
}

fn manager_with_timeout(network: &Arc<MemoryNetwork>, id: &str, timeout: Duration) -> ProxyManager {
    let communicator: Arc<dyn ClusterCommunicator> = network.join(node(id));
    ProxyManager::new(communicator, ProxyConfig { timeout })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_calls_reach_the_serving_node() {
    let _ = tracing_subscriber::fmt::try_init();

    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    let counter: Arc<dyn Counter> = LocalCounter::starting_at(0);
    server
        .register_proxy_service::<dyn Counter, _>(counter, CborSerializer)
        .unwrap();

    let factory = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap();
    let remote = factory.get_proxy_for(&node("n1"));

    assert_eq!(remote.add(5).await.unwrap(), 5);
    assert_eq!(remote.add(2).await.unwrap(), 7);

    let total = tokio::task::spawn_blocking(move || remote.total())
        .await
        .unwrap();
    assert_eq!(total.unwrap(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_call_from_async_context() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(42), JsonSerializer)
        .unwrap();

    let remote = client
        .get_proxy_factory::<dyn Counter, _>(JsonSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));
    assert_eq!(remote.total().unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_call_from_plain_thread() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(7), CborSerializer)
        .unwrap();

    let remote = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));

    let caller = std::thread::spawn(move || remote.total());
    let total = tokio::task::spawn_blocking(move || caller.join().unwrap())
        .await
        .unwrap();
    assert_eq!(total.unwrap(), 7);
}

#[tokio::test]
async fn test_blocking_call_needs_multi_threaded_runtime() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(1), CborSerializer)
        .unwrap();

    let remote = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));
    assert_matches!(remote.total(), Err(ProxyError::BlockingUnsupported));
    assert_eq!(remote.add(1).await.unwrap(), 2);
}

#[tokio::test]
async fn test_proxies_are_cached_per_node() {
    let network = MemoryNetwork::new();
    let client = manager(&network, "n1");

    let factory = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap();
    let first = factory.get_proxy_for(&node("n2"));
    let again = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n2"));
    let other = factory.get_proxy_for(&node("n3"));

    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
}

#[tokio::test]
async fn test_reregistration_replaces_implementation() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(0), CborSerializer)
        .unwrap();
    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(100), CborSerializer)
        .unwrap();

    let remote = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));
    assert_eq!(remote.add(1).await.unwrap(), 101);
}

#[tokio::test]
async fn test_unregistered_service_rejects_calls() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(0), CborSerializer)
        .unwrap();
    let remote = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));
    assert_eq!(remote.add(3).await.unwrap(), 3);

    server.unregister_proxy_service::<dyn Counter>();

    assert_matches!(
        remote.add(3).await,
        Err(ProxyError::Transport(TransportError::NoHandler { subject, .. }))
            if subject == "proxy-service-counter"
    );
}

#[tokio::test]
async fn test_implementation_failure_reaches_caller() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager(&network, "n2");

    server
        .register_proxy_service::<dyn Counter, _>(LocalCounter::starting_at(0), CborSerializer)
        .unwrap();
    let remote = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap()
        .get_proxy_for(&node("n1"));

    assert_matches!(
        remote.add(0).await,
        Err(ProxyError::Remote(message)) if message == "amount must be positive"
    );
}

#[tokio::test]
async fn test_unreachable_and_slow_nodes() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");
    let client = manager_with_timeout(&network, "n2", Duration::from_millis(100));

    let slow: Arc<dyn Counter> = Arc::new(LocalCounter {
        total: AtomicU64::new(0),
        delay: Duration::from_secs(2),
    });
    server
        .register_proxy_service::<dyn Counter, _>(slow, CborSerializer)
        .unwrap();

    let factory = client
        .get_proxy_factory::<dyn Counter, _>(CborSerializer)
        .unwrap();

    assert_matches!(
        factory.get_proxy_for(&node("n1")).add(1).await,
        Err(ProxyError::Transport(TransportError::Timeout(_)))
    );
    assert_matches!(
        factory.get_proxy_for(&node("n9")).add(1).await,
        Err(ProxyError::Transport(TransportError::Unreachable(target))) if target == node("n9")
    );
}

#[tokio::test]
async fn test_incomplete_interface_is_rejected() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");

    let result = server.register_proxy_service::<dyn Incomplete, _>(Arc::new(Nothing), CborSerializer);
    assert_matches!(
        result,
        Err(ProxyError::InvalidInterface { interface: "incomplete", .. })
    );
}

#[tokio::test]
async fn test_concrete_types_are_not_interfaces() {
    let network = MemoryNetwork::new();
    let server = manager(&network, "n1");

    assert_matches!(
        server.register_proxy_service::<Standalone, _>(Arc::new(Standalone), CborSerializer),
        Err(ProxyError::InvalidInterface { interface: "standalone", .. })
    );
    assert_matches!(
        server.get_proxy_factory::<Standalone, _>(CborSerializer),
        Err(ProxyError::InvalidInterface { interface: "standalone", .. })
    );
}
