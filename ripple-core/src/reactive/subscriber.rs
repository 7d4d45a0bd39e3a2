//! Subscriber types for the reactive system.
//!
//! A subscriber is a callback registered on a cell or computed node. Both
//! kinds of node keep their subscribers in a [`SubscriberList`] and expose
//! themselves to the tracking context through the [`Source`] trait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

/// Notification callback invoked after a source commits a change.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a subscription.
///
/// Returned by `subscribe` and accepted by `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for anything that can be read inside a tracking frame.
///
/// Cells and computed nodes draw from the same counter, so a read set can
/// hold both without collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

/// A readable node that computations can depend on.
///
/// Implemented by cells and computed nodes. The tracking context records
/// sources as `Arc<dyn Source>` so a computed node can subscribe to whatever
/// it read without knowing the concrete value types.
pub trait Source: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// Register a notification callback.
    ///
    /// Returns `None` if the source has been disposed.
    fn add_subscriber(&self, notify: Callback) -> Option<SubscriptionId>;

    /// Remove a previously registered callback.
    fn remove_subscriber(&self, id: SubscriptionId) -> bool;
}

/// A registered subscriber.
///
/// The `live` flag is shared with every snapshot taken during notification,
/// so unsubscribing mid-pass stops any further delivery to this subscriber.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriptionId,
    notify: Callback,
    live: Arc<AtomicBool>,
}

impl Subscriber {
    /// Create a new subscriber with the given notification callback.
    pub fn new(notify: Callback) -> Self {
        Self {
            id: SubscriptionId::new(),
            notify,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get the subscription's unique ID.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Invoke the callback unless the subscription was cancelled.
    pub fn notify(&self) {
        if self.is_live() {
            (self.notify)();
        }
    }

    fn cancel(&self) {
        self.live.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Snapshot of a subscriber list taken before fan-out.
pub type SubscriberSnapshot = SmallVec<[Subscriber; 4]>;

/// Subscribers in subscription order.
#[derive(Debug, Default)]
pub struct SubscriberList {
    entries: SmallVec<[Subscriber; 4]>,
}

impl SubscriberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, notify: Callback) -> SubscriptionId {
        let subscriber = Subscriber::new(notify);
        let id = subscriber.id();
        self.entries.push(subscriber);
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        match self.entries.iter().position(|s| s.id == id) {
            Some(index) => {
                let removed = self.entries.remove(index);
                removed.cancel();
                true
            }
            None => false,
        }
    }

    /// Copy the current subscribers so callbacks can run without the list
    /// being borrowed.
    pub fn snapshot(&self) -> SubscriberSnapshot {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        for subscriber in self.entries.drain(..) {
            subscriber.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deliver a notification to every live subscriber in the snapshot.
pub fn notify_all(snapshot: &SubscriberSnapshot) {
    tracing::trace!(count = snapshot.len(), "notifying subscribers");
    for subscriber in snapshot {
        subscriber.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn subscription_ids_are_unique() {
        let id1 = SubscriptionId::new();
        let id2 = SubscriptionId::new();
        let id3 = SubscriptionId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn subscriber_notify_calls_callback() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let subscriber = Subscriber::new(Arc::new(move || {
            called_clone.store(true, Ordering::SeqCst);
        }));

        assert!(!called.load(Ordering::SeqCst));
        subscriber.notify();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn removed_subscriber_is_skipped_by_existing_snapshot() {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();

        let mut list = SubscriberList::new();
        let id = list.add(Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let snapshot = list.snapshot();
        assert!(list.remove(id));
        notify_all(&snapshot);

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(list.is_empty());
    }

    #[test]
    fn list_preserves_subscription_order() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut list = SubscriberList::new();

        for tag in 0..6 {
            let order = order.clone();
            list.add(Arc::new(move || order.lock().push(tag)));
        }

        notify_all(&list.snapshot());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5]);
    }
}
