//! Cluster events and listener registration

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::diff::ClusterMetadataDiff;
use crate::metadata::ClusterMetadata;
use crate::node::ControllerNode;

/// Kind of node lifecycle transition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ClusterEventType {
    /// A node joined the cluster definition.
    InstanceAdded,
    /// A node left the cluster definition.
    InstanceRemoved,
    /// A node became reachable.
    InstanceActivated,
    /// A node finished starting.
    InstanceReady,
    /// A node stopped responding.
    InstanceDeactivated,
    /// A known node started advertising a different software version.
    InstanceUpdated,
}

/// A node lifecycle transition as observed by the local directory.
#[derive(Clone, Debug)]
pub struct ClusterEvent {
    /// What happened.
    pub event_type: ClusterEventType,
    /// The node it happened to.
    pub subject: ControllerNode,
    /// When the local node observed it.
    pub time: DateTime<Utc>,
}

impl ClusterEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(event_type: ClusterEventType, subject: ControllerNode) -> Self {
        Self {
            event_type,
            subject,
            time: Utc::now(),
        }
    }
}

/// Replacement of the stored cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterMetadataEvent {
    /// Previous generation, if any.
    pub old: Option<ClusterMetadata>,
    /// Newly committed generation.
    pub new: ClusterMetadata,
    /// Store version of the new generation.
    pub version: u64,
}

impl ClusterMetadataEvent {
    /// Node and partition changes carried by this event.
    #[must_use]
    pub fn diff(&self) -> ClusterMetadataDiff {
        ClusterMetadataDiff::new(self.old.as_ref(), &self.new)
    }

    /// Whether the partition layout changed, which requires every node to
    /// restart its coordination services.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        self.old
            .as_ref()
            .is_some_and(|old| !old.same_partitions(&self.new))
    }
}

/// Handle returned by [`ListenerRegistry::add_listener`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

/// Callback invoked for every event.
pub type EventListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Explicit publish/subscribe registry.
///
/// Listeners are invoked synchronously in registration order on the
/// publishing task; they must not block. Asynchronous consumers use
/// [`ListenerRegistry::subscribe`] instead.
pub struct ListenerRegistry<E> {
    listeners: RwLock<Vec<(ListenerId, EventListener<E>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<E>,
}

impl<E> Debug for ListenerRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<E: Clone + Send + 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> ListenerRegistry<E> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a callback.
    pub fn add_listener(&self, listener: EventListener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Receive events on a channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Deliver an event to every listener and subscriber.
    pub fn publish(&self, event: &E) {
        // Snapshot so listeners may (un)register without deadlocking.
        let listeners: Vec<EventListener<E>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }

        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_receive_until_removed() {
        let registry = ListenerRegistry::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let id = registry.add_listener(Arc::new(move |value: &u32| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        }));

        registry.publish(&2);
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        registry.publish(&5);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let registry = ListenerRegistry::<&'static str>::new();
        let mut rx = registry.subscribe();

        registry.publish(&"hello");

        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn test_listener_may_unregister_itself() {
        let registry = Arc::new(ListenerRegistry::<u32>::new());
        let slot: Arc<parking_lot::Mutex<Option<ListenerId>>> = Arc::default();

        let weak = Arc::downgrade(&registry);
        let own_id = slot.clone();
        let id = registry.add_listener(Arc::new(move |_: &u32| {
            if let (Some(registry), Some(id)) = (weak.upgrade(), *own_id.lock()) {
                registry.remove_listener(id);
            }
        }));
        *slot.lock() = Some(id);

        registry.publish(&1);
        assert!(!registry.remove_listener(id));
    }
}
