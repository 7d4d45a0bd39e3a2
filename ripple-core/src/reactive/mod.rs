//! Reactive Primitives
//!
//! This module implements the dependency graph: cells, computed nodes and
//! the tracking context that connects them.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A [`Cell`] is a container for mutable state. Reading a cell inside a
//! tracking frame records it as a dependency of the running computation.
//! Writing a different value notifies every subscriber synchronously.
//!
//! ## Computed Nodes
//!
//! A [`Computed`] node is a derived value that caches its result. It
//! re-evaluates when one of the sources it read last time notifies, and only
//! notifies its own subscribers when the result actually changed.
//!
//! ## Tracking Context
//!
//! The [`TrackingContext`] is a stack of frames. A computed node pushes a
//! frame around its compute function and subscribes to everything read while
//! the frame was on top. Because discovery happens by execution, a node that
//! reads different cells on different branches always subscribes to exactly
//! the cells its last run touched.
//!
//! # Implementation Notes
//!
//! Subscriber lists are snapshotted before fan-out and each subscription
//! carries a liveness flag, so callbacks may subscribe or unsubscribe while a
//! notification pass is running.

mod cell;
mod computed;
mod context;
mod subscriber;

pub use cell::{Cell, EqualityFn};
pub use computed::{Computed, ComputedBuilder, ErrorHandler, NodeStatus};
pub use context::{FrameId, ReadSet, TrackingContext, TrackingScope};
pub use subscriber::{Callback, Source, SourceId, Subscriber, SubscriberList, SubscriptionId};
