//! Computed Implementation
//!
//! A Computed node is a cached derived value. It subscribes to whatever it
//! read during its last successful evaluation and recomputes when any of
//! those sources notifies.
//!
//! # How Computed Nodes Work
//!
//! 1. Evaluation opens a tracking frame, runs the compute function and
//!    closes the frame. The frame's read set becomes the dependency set.
//!
//! 2. On recompute, the new read set is diffed against the current
//!    subscriptions: sources no longer read are unsubscribed first, then
//!    newly read sources are subscribed. A source read on both runs keeps
//!    its existing subscription.
//!
//! 3. Subscribers of the node are notified only when the new value differs
//!    from the cached one.
//!
//! # Failures
//!
//! A failing compute function leaves the cached value and the dependency set
//! exactly as they were after the last success. The failure is stored, sent
//! to the error handler if one was registered, and subscribers are still
//! notified so they can inspect [`Computed::last_error`].
//!
//! # Cache Duration
//!
//! A node built with a cache duration also recomputes on the first read after
//! the duration has elapsed. This covers computations that read ambient
//! state no cell can observe.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use super::cell::{default_equality, EqualityFn};
use super::context::{ReadSet, TrackingContext};
use super::subscriber::{notify_all, Callback, Source, SourceId, SubscriberList, SubscriptionId};
use crate::error::{Error, Result};
use crate::timer::{Clock, SystemClock};

/// External sink for computation failures.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

type ComputeFn<T> = Box<dyn Fn() -> std::result::Result<T, String> + Send + Sync>;

/// Evaluation status of a computed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// No successful evaluation yet.
    Uninitialized,

    /// The compute function is running.
    Evaluating,

    /// The cached value reflects the last evaluation.
    Settled,
}

struct NodeState<T> {
    status: NodeStatus,
    value: Option<T>,
    last_error: Option<Error>,
    computed_at: Option<Instant>,
    evaluations: usize,
}

struct Dependency {
    source: Arc<dyn Source>,
    subscription: SubscriptionId,
}

struct ComputedInner<T> {
    id: SourceId,
    context: TrackingContext,
    compute: ComputeFn<T>,
    equality: EqualityFn<T>,
    state: Mutex<NodeState<T>>,
    dependencies: Mutex<IndexMap<SourceId, Dependency>>,
    subscribers: Mutex<SubscriberList>,
    cache_duration: Option<Duration>,
    clock: Arc<dyn Clock>,
    error_handler: Option<ErrorHandler>,
    disposed: AtomicBool,
    this: Weak<ComputedInner<T>>,
}

impl<T> ComputedInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::disposed("computed node", self.id.raw()))
        } else {
            Ok(())
        }
    }

    fn is_expired(&self, state: &NodeState<T>) -> bool {
        match (self.cache_duration, state.computed_at) {
            (Some(duration), Some(at)) => self.clock.now().saturating_duration_since(at) >= duration,
            _ => false,
        }
    }

    /// Run the compute function inside a fresh frame and apply the outcome.
    fn evaluate(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.status == NodeStatus::Evaluating {
                return Err(Error::Cycle(self.id.raw()));
            }
            state.status = NodeStatus::Evaluating;
        }

        let scope = self.context.scope();
        let outcome = (self.compute)();
        let mut reads = scope.finish();
        reads.remove(self.id);

        match outcome {
            Ok(value) => {
                self.rewire(reads);
                let changed = {
                    let mut state = self.state.lock();
                    let changed = match &state.value {
                        Some(old) => !(self.equality)(old, &value),
                        None => true,
                    };
                    if changed {
                        state.value = Some(value);
                    }
                    state.status = NodeStatus::Settled;
                    state.last_error = None;
                    state.computed_at = Some(self.clock.now());
                    state.evaluations += 1;
                    changed
                };
                tracing::debug!(node = self.id.raw(), changed, "computed node evaluated");
                if changed {
                    self.notify_subscribers();
                }
                Ok(())
            }
            Err(message) => {
                let error = Error::Computation {
                    node: self.id.raw(),
                    message,
                };
                {
                    let mut state = self.state.lock();
                    state.status = if state.value.is_some() {
                        NodeStatus::Settled
                    } else {
                        NodeStatus::Uninitialized
                    };
                    state.last_error = Some(error.clone());
                }
                tracing::warn!(node = self.id.raw(), %error, "computation failed, keeping last value");
                if let Some(handler) = &self.error_handler {
                    handler(&error);
                }
                self.notify_subscribers();
                Err(error)
            }
        }
    }

    /// Replace the dependency set with `reads`.
    fn rewire(&self, reads: ReadSet) {
        let fresh = reads.into_sources();
        let mut dependencies = self.dependencies.lock();

        let stale: Vec<SourceId> = dependencies
            .keys()
            .filter(|id| !fresh.contains_key(*id))
            .copied()
            .collect();
        for id in stale {
            if let Some(dependency) = dependencies.shift_remove(&id) {
                dependency.source.remove_subscriber(dependency.subscription);
            }
        }

        for (id, source) in fresh {
            if dependencies.contains_key(&id) {
                continue;
            }
            if let Some(subscription) = source.add_subscriber(self.callback()) {
                dependencies.insert(id, Dependency { source, subscription });
            }
        }
    }

    fn callback(&self) -> Callback {
        let node = self.this.clone();
        Arc::new(move || {
            if let Some(node) = node.upgrade() {
                node.on_dependency_changed();
            }
        })
    }

    fn on_dependency_changed(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        if self.state.lock().status == NodeStatus::Evaluating {
            tracing::debug!(node = self.id.raw(), "dependency changed during own evaluation, ignored");
            return;
        }
        // Failures are recorded in the node state and reported to the handler.
        let _ = self.evaluate();
    }

    fn notify_subscribers(&self) {
        let snapshot = self.subscribers.lock().snapshot();
        notify_all(&snapshot);
    }

    fn release_dependencies(&self) {
        let drained: Vec<Dependency> = self.dependencies.lock().drain(..).map(|(_, d)| d).collect();
        for dependency in drained {
            dependency.source.remove_subscriber(dependency.subscription);
        }
    }
}

impl<T> Source for ComputedInner<T>
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

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        for (_, dependency) in self.dependencies.get_mut().drain(..) {
            dependency.source.remove_subscriber(dependency.subscription);
        }
    }
}

/// A cached value derived from cells and other computed nodes.
///
/// Cloning yields another handle to the same node.
///
/// # Example
///
/// ```rust
/// use ripple_core::reactive::{Cell, Computed, TrackingContext};
///
/// let ctx = TrackingContext::new();
/// let count = Cell::new(&ctx, 2);
///
/// let source = count.clone();
/// let doubled = Computed::new(&ctx, move || source.read().unwrap_or(0) * 2);
///
/// count.write(5).unwrap();
/// assert_eq!(doubled.value().unwrap(), 10);
/// ```
pub struct Computed<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create and eagerly evaluate a node from an infallible function.
    pub fn new<F>(context: &TrackingContext, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        ComputedBuilder::new(context).build(compute)
    }

    /// Create and eagerly evaluate a node from a fallible function.
    pub fn try_new<F, E>(context: &TrackingContext, compute: F) -> Self
    where
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        ComputedBuilder::new(context).try_build(compute)
    }

    /// Start configuring a node.
    pub fn builder(context: &TrackingContext) -> ComputedBuilder<T> {
        ComputedBuilder::new(context)
    }

    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// Get the current value, evaluating first if the node has no value yet
    /// or its cache duration has elapsed.
    ///
    /// Inside a tracking frame the node is recorded as a dependency.
    pub fn value(&self) -> Result<T> {
        self.inner.ensure_live()?;
        let needs_evaluation = {
            let state = self.inner.state.lock();
            if state.status == NodeStatus::Evaluating {
                return Err(Error::Cycle(self.inner.id.raw()));
            }
            state.value.is_none() || self.inner.is_expired(&state)
        };
        self.inner.context.track(&self.inner);

        if needs_evaluation {
            // A failure leaves the previous value in place; it is surfaced below
            // only if there is nothing to return.
            let _ = self.inner.evaluate();
        }

        let state = self.inner.state.lock();
        match &state.value {
            Some(value) => Ok(value.clone()),
            None => Err(state.last_error.clone().unwrap_or(Error::Computation {
                node: self.inner.id.raw(),
                message: "node has no value".to_string(),
            })),
        }
    }

    /// Get the cached value without tracking or evaluating.
    pub fn peek(&self) -> Option<T> {
        self.inner.state.lock().value.clone()
    }

    /// Force a recompute, regardless of dependency notifications.
    pub fn refresh(&self) -> Result<()> {
        self.inner.ensure_live()?;
        self.inner.evaluate()
    }

    /// Register a callback invoked when the value changes or a recompute fails.
    pub fn subscribe<F>(&self, notify: F) -> Result<SubscriptionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.ensure_live()?;
        Ok(self.inner.subscribers.lock().add(Arc::new(notify)))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove_subscriber(id)
    }

    /// Dispose of the node, removing every subscription in both directions.
    ///
    /// Calling this again is a no-op.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.release_dependencies();
        self.inner.subscribers.lock().clear();
        tracing::debug!(node = self.inner.id.raw(), "computed node disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.state.lock().status
    }

    /// The failure of the most recent evaluation, if it failed.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.state.lock().last_error.clone()
    }

    /// Number of successful evaluations so far.
    pub fn evaluation_count(&self) -> usize {
        self.inner.state.lock().evaluations
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.dependencies.lock().len()
    }

    pub fn depends_on(&self, id: SourceId) -> bool {
        self.inner.dependencies.lock().contains_key(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("value", &state.value)
            .field("dependency_count", &self.inner.dependencies.lock().len())
            .finish()
    }
}

/// Builder for [`Computed`] nodes with non-default options.
pub struct ComputedBuilder<T> {
    context: TrackingContext,
    equality: Option<EqualityFn<T>>,
    cache_duration: Option<Duration>,
    clock: Arc<dyn Clock>,
    error_handler: Option<ErrorHandler>,
    lazy: bool,
}

impl<T> ComputedBuilder<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    pub fn new(context: &TrackingContext) -> Self {
        Self {
            context: context.clone(),
            equality: None,
            cache_duration: None,
            clock: Arc::new(SystemClock),
            error_handler: None,
            lazy: false,
        }
    }

    /// Equality used to decide whether a recompute changed the value.
    pub fn equality(mut self, equality: EqualityFn<T>) -> Self {
        self.equality = Some(equality);
        self
    }

    /// Force a recompute on the first read after `duration`.
    pub fn cache_duration(mut self, duration: Duration) -> Self {
        self.cache_duration = Some(duration);
        self
    }

    /// Clock used for the cache duration.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_error(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Defer the first evaluation until the first read.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn build<F>(self, compute: F) -> Computed<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.assemble(Box::new(move || Ok(compute())))
    }

    pub fn try_build<F, E>(self, compute: F) -> Computed<T>
    where
        F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        self.assemble(Box::new(move || compute().map_err(|e| e.to_string())))
    }

    fn assemble(self, compute: ComputeFn<T>) -> Computed<T> {
        let lazy = self.lazy;
        let inner = Arc::new_cyclic(|this| ComputedInner {
            id: SourceId::new(),
            context: self.context,
            compute,
            equality: self.equality.unwrap_or_else(default_equality),
            state: Mutex::new(NodeState {
                status: NodeStatus::Uninitialized,
                value: None,
                last_error: None,
                computed_at: None,
                evaluations: 0,
            }),
            dependencies: Mutex::new(IndexMap::new()),
            subscribers: Mutex::new(SubscriberList::new()),
            cache_duration: self.cache_duration,
            clock: self.clock,
            error_handler: self.error_handler,
            disposed: AtomicBool::new(false),
            this: this.clone(),
        });

        if !lazy {
            // A failed first evaluation is kept in the node state.
            let _ = inner.evaluate();
        }
        Computed { inner }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
