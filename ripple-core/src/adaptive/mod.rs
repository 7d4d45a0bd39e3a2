//! Adaptive Updates
//!
//! The adaptive layer decides when, and whether, a proposed change reaches
//! the dependency graph. An [`AdaptiveCell`] wraps a reactive cell with:
//!
//! - a [`TransitionLog`] of every proposal,
//! - the [`ContextSignals`] describing the environment,
//! - one [`UpdateOptimizer`] that turns a proposal into a [`Decision`].
//!
//! Committed values flow into the wrapped cell and propagate through
//! computed nodes as usual.

mod cell;
pub mod optimizer;
mod signal;
mod transition;

pub use cell::{AdaptiveCell, AdaptiveCellBuilder, DEFAULT_HISTORY_CAPACITY};
pub use optimizer::{
    CommitHandler, Debounce, Decision, OptimizerKind, Predictive, PredictiveConfig, Strategy, Throttle,
    UpdateOptimizer,
};
pub use signal::{ContextSignal, ContextSignals, ContextSnapshot, ManualSignal, BATTERY, NETWORK, PERFORMANCE};
pub use transition::{Transition, TransitionLog};
