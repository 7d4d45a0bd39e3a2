//! Cell Implementation
//!
//! A Cell is the fundamental reactive primitive. It holds a value and
//! notifies its subscribers when that value changes.
//!
//! # How Cells Work
//!
//! 1. When a cell is read inside a tracking frame, the cell registers itself
//!    with the frame so the enclosing computation can subscribe to it.
//!
//! 2. A write that is equal (under the cell's equality function) to the
//!    current value is ignored.
//!
//! 3. Any other write swaps the value, then synchronously notifies every
//!    subscriber in subscription order before returning.
//!
//! # Thread Safety
//!
//! The value lives behind a `RwLock` and subscribers behind a `Mutex`. No lock
//! is held while subscriber callbacks run, so a callback may read, write,
//! subscribe or unsubscribe on the same cell.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::context::TrackingContext;
use super::subscriber::{notify_all, Callback, Source, SourceId, SubscriberList, SubscriptionId};
use crate::error::{Error, Result};

/// Equality used to suppress no-op writes.
pub type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

pub(crate) fn default_equality<T: PartialEq>() -> EqualityFn<T> {
    Arc::new(|a: &T, b: &T| a == b)
}

struct CellInner<T> {
    id: SourceId,
    context: TrackingContext,
    value: RwLock<T>,
    equality: EqualityFn<T>,
    subscribers: Mutex<SubscriberList>,
    disposed: AtomicBool,
}

impl<T> CellInner<T> {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::disposed("cell", self.id.raw()))
        } else {
            Ok(())
        }
    }
}

impl<T> Source for CellInner<T>
where
    T: Send + Sync,
{
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn add_subscriber(&self, notify: Callback) -> Option<SubscriptionId> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        Some(self.subscribers.lock().add(notify))
    }

    fn remove_subscriber(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().remove(id)
    }
}

/// An observable value slot.
///
/// Cloning a cell yields another handle to the same slot.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Cell, TrackingContext};
///
/// let ctx = TrackingContext::new();
/// let count = Cell::new(&ctx, 0);
///
/// count.write(5).unwrap();
/// assert_eq!(count.read().unwrap(), 5);
/// ```
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new cell that compares values with `PartialEq`.
    pub fn new(context: &TrackingContext, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(context, value, default_equality())
    }

    /// Create a new cell with a custom equality function.
    pub fn with_equality(context: &TrackingContext, value: T, equality: EqualityFn<T>) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: SourceId::new(),
                context: context.clone(),
                value: RwLock::new(value),
                equality,
                subscribers: Mutex::new(SubscriberList::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If called inside a tracking frame, the cell is recorded as a
    /// dependency of the running computation.
    pub fn read(&self) -> Result<T> {
        self.inner.ensure_live()?;
        self.inner.context.track(&self.inner);
        Ok(self.inner.value.read().clone())
    }

    /// Get the current value without recording a dependency.
    pub fn read_untracked(&self) -> Result<T> {
        self.inner.ensure_live()?;
        Ok(self.inner.value.read().clone())
    }

    /// Set a new value and notify subscribers.
    ///
    /// Returns `Ok(false)` when the value was equal to the current one and
    /// nothing was notified.
    pub fn write(&self, value: T) -> Result<bool> {
        self.inner.ensure_live()?;
        {
            let mut guard = self.inner.value.write();
            if (self.inner.equality)(&*guard, &value) {
                return Ok(false);
            }
            *guard = value;
        }

        let snapshot = self.inner.subscribers.lock().snapshot();
        notify_all(&snapshot);
        Ok(true)
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            self.inner.ensure_live()?;
            let guard = self.inner.value.read();
            f(&*guard)
        };
        self.write(next)
    }

    /// Register a callback invoked after every committed write.
    pub fn subscribe<F>(&self, notify: F) -> Result<SubscriptionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.subscribers.lock().add(Arc::new(notify)))
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove_subscriber(id)
    }

    /// Dispose of the cell, dropping every subscriber.
    ///
    /// Later reads and writes fail with [`Error::Disposed`]. Calling this
    /// again is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.subscribers.lock().clear();
        tracing::debug!(cell = self.inner.id.raw(), "cell disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// The tracking context this cell reports reads to.
    pub fn context(&self) -> &TrackingContext {
        &self.inner.context
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Cell<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .field("subscriber_count", &self.inner.subscribers.lock().len())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
