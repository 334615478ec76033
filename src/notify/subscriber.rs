//! Subscriber-based notifications for store changes.

use crate::core::Snapshot;
use parking_lot::RwLock;
use std::sync::Arc;

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Handle for a subscription that can be dropped to unsubscribe.
///
/// When the handle is dropped, the subscription is removed immediately.
pub struct SubscriptionHandle {
    id: usize,
    registry: Arc<RwLock<SubscriberRegistryInner>>,
}

impl SubscriptionHandle {
    /// Keep the subscription alive for the lifetime of the registry.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let id = self.id;
        self.registry
            .write()
            .subscribers
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

#[derive(Default)]
struct SubscriberRegistryInner {
    subscribers: Vec<(usize, Callback)>,
    next_id: usize,
}

/// Registry for store change subscribers.
///
/// Callbacks receive the snapshot that was just published. They run on the
/// task that published it, after the write lock has been released.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::Snapshot;
/// use hotswap_store::notify::SubscriberRegistry;
///
/// let registry = SubscriberRegistry::new();
/// let handle = registry.subscribe(|snapshot| {
///     println!("configuration now has {} top-level keys", snapshot.len());
/// });
///
/// registry.notify_all(&Snapshot::new());
///
/// // Unsubscribe by dropping the handle
/// drop(handle);
/// assert_eq!(registry.subscriber_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RwLock<SubscriberRegistryInner>>,
}

impl SubscriberRegistry {
    /// Create a new subscriber registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked after every published change.
    ///
    /// Returns a handle that unsubscribes when dropped.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, Arc::new(callback)));

        SubscriptionHandle {
            id,
            registry: Arc::clone(&self.inner),
        }
    }

    /// Invoke every callback, in subscription order, with `snapshot`.
    ///
    /// The list is copied first, so callbacks may subscribe or unsubscribe.
    pub fn notify_all(&self, snapshot: &Snapshot) {
        let callbacks: Vec<Callback> = self
            .inner
            .read()
            .subscribers
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().subscribers.len()
    }
}
