//! Adaptive Cell
//!
//! An [`AdaptiveCell`] is an observable cell whose writes pass through an
//! [`UpdateOptimizer`]. Each proposal is recorded in the transition log
//! together with a snapshot of the attached context signals, the optimizer is
//! handed that snapshot, and whatever it decides to commit is written to the
//! underlying [`Cell`]. Deferred values reach the cell later through a commit
//! handler bound at construction.
//!
//! Readers see a plain cell: [`AdaptiveCell::cell`] can be read from inside a
//! computed node like any other dependency.

use std::sync::Arc;

use super::optimizer::{Decision, UpdateOptimizer};
use super::signal::ContextSignals;
use super::transition::TransitionLog;
use crate::config::AdaptiveConfig;
use crate::error::{Error, Result};
use crate::reactive::{Cell, SourceId, SubscriptionId, TrackingContext};
use crate::timer::{Clock, Scheduler, SystemClock};

/// Default number of transitions kept per cell.
pub const DEFAULT_HISTORY_CAPACITY: usize = 64;

/// A cell whose writes are filtered by an update optimizer.
///
/// # Example
///
/// ```rust
/// use ripple_core::adaptive::{AdaptiveCell, Decision, UpdateOptimizer};
/// use ripple_core::reactive::TrackingContext;
///
/// let ctx = TrackingContext::new();
/// let mut cell = AdaptiveCell::new(&ctx, 0, UpdateOptimizer::pass_through()).unwrap();
///
/// assert_eq!(cell.set_state(1).unwrap(), Decision::Commit(1));
/// assert_eq!(cell.read().unwrap(), 1);
/// ```
pub struct AdaptiveCell<T> {
    cell: Cell<T>,
    log: TransitionLog<T>,
    signals: ContextSignals,
    optimizer: UpdateOptimizer<T>,
    clock: Arc<dyn Clock>,
    disposed: bool,
}

impl<T> AdaptiveCell<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// A cell with no context signals, a wall clock and the default history.
    pub fn new(context: &TrackingContext, initial: T, optimizer: UpdateOptimizer<T>) -> Result<Self> {
        Self::builder(context, initial).optimizer(optimizer).build()
    }

    pub fn builder(context: &TrackingContext, initial: T) -> AdaptiveCellBuilder<T> {
        AdaptiveCellBuilder::new(context, initial)
    }

    /// Build from deserialized configuration. Timers and timestamps come
    /// from `scheduler`.
    pub fn from_config<S>(
        context: &TrackingContext,
        initial: T,
        config: &AdaptiveConfig,
        scheduler: &Arc<S>,
    ) -> Result<Self>
    where
        S: Scheduler + 'static,
    {
        Self::builder(context, initial)
            .history_capacity(config.history_capacity)
            .optimizer(config.optimizer.build(scheduler)?)
            .clock(Arc::clone(scheduler) as Arc<dyn Clock>)
            .build()
    }

    fn assemble(
        cell: Cell<T>,
        log: TransitionLog<T>,
        signals: ContextSignals,
        optimizer: UpdateOptimizer<T>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let target = cell.clone();
        optimizer.bind_commit(Arc::new(move |value| {
            if let Err(error) = target.write(value) {
                tracing::warn!(%error, "deferred commit failed");
            }
        }));
        Self {
            cell,
            log,
            signals,
            optimizer,
            clock,
            disposed: false,
        }
    }

    pub fn id(&self) -> SourceId {
        self.cell.id()
    }

    /// Current committed value, tracked like any cell read.
    pub fn read(&self) -> Result<T> {
        self.cell.read()
    }

    pub fn read_untracked(&self) -> Result<T> {
        self.cell.read_untracked()
    }

    /// Propose a new value.
    ///
    /// The proposal is logged, the optimizer sees the latest signal snapshot
    /// and decides. A committed value is written to the cell before this
    /// returns. If the optimizer fails, the proposal itself is committed.
    pub fn set_state(&mut self, proposed: T) -> Result<Decision<T>> {
        self.ensure_live()?;

        let current = self.cell.read_untracked()?;
        let snapshot = self.signals.snapshot();
        self.log
            .record(current, proposed.clone(), self.clock.now(), snapshot.clone());

        let optimizer = std::mem::replace(&mut self.optimizer, UpdateOptimizer::pass_through());
        self.optimizer = optimizer.with_context_signals(snapshot);

        let decision = match self.optimizer.optimize(proposed.clone(), &self.log) {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(
                    %error,
                    kind = %self.optimizer.kind(),
                    "optimizer failed, committing proposal as-is"
                );
                Decision::Commit(proposed)
            }
        };

        if let Decision::Commit(value) = &decision {
            self.cell.write(value.clone())?;
        }
        Ok(decision)
    }

    /// Commit any buffered value now and return it.
    pub fn flush(&mut self) -> Result<Option<T>> {
        self.ensure_live()?;
        let pending = self.optimizer.flush()?;
        if let Some(value) = &pending {
            self.cell.write(value.clone())?;
        }
        Ok(pending)
    }

    /// A new cell seeded with the current value and a copy of the history,
    /// driven by `optimizer`. This cell is unaffected.
    pub fn with_strategy(&self, optimizer: UpdateOptimizer<T>) -> Result<Self> {
        self.ensure_live()?;
        let cell = Cell::new(self.cell.context(), self.cell.read_untracked()?);
        Ok(Self::assemble(
            cell,
            self.log.clone(),
            self.signals.clone(),
            optimizer,
            Arc::clone(&self.clock),
        ))
    }

    /// A new cell seeded with the current value and a copy of the history,
    /// reading `signals`. The optimizer is rebuilt with the same strategy and
    /// no accumulated state. This cell is unaffected.
    pub fn with_context_signals(&self, signals: ContextSignals) -> Result<Self> {
        self.ensure_live()?;
        let cell = Cell::new(self.cell.context(), self.cell.read_untracked()?);
        Ok(Self::assemble(
            cell,
            self.log.clone(),
            signals,
            self.optimizer.fresh(),
            Arc::clone(&self.clock),
        ))
    }

    pub fn subscribe<F>(&self, notify: F) -> Result<SubscriptionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.ensure_live()?;
        self.cell.subscribe(notify)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.cell.unsubscribe(id)
    }

    /// Cancel pending commits and dispose of the underlying cell.
    ///
    /// Attached signals are left alone; they may be shared with other
    /// cells. Calling this again is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.optimizer.dispose();
        self.cell.dispose();
        tracing::debug!(cell = self.cell.id().raw(), "adaptive cell disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Every proposal made so far, newest last.
    pub fn history(&self) -> &TransitionLog<T> {
        &self.log
    }

    /// The underlying cell, for use as a computed dependency.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    pub fn optimizer(&self) -> &UpdateOptimizer<T> {
        &self.optimizer
    }

    pub fn signals(&self) -> &ContextSignals {
        &self.signals
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(Error::disposed("adaptive cell", self.cell.id().raw()))
        } else {
            Ok(())
        }
    }
}

impl<T> std::fmt::Debug for AdaptiveCell<T>
where
    T: std::fmt::Debug + Clone + PartialEq + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveCell")
            .field("value", &self.cell.read_untracked().ok())
            .field("optimizer", &self.optimizer.kind())
            .field("history", &self.log.len())
            .field("signals", &self.signals)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Builder for [`AdaptiveCell`].
pub struct AdaptiveCellBuilder<T> {
    context: TrackingContext,
    initial: T,
    history_capacity: usize,
    signals: ContextSignals,
    optimizer: Option<UpdateOptimizer<T>>,
    clock: Arc<dyn Clock>,
}

impl<T> AdaptiveCellBuilder<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(context: &TrackingContext, initial: T) -> Self {
        Self {
            context: context.clone(),
            initial,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            signals: ContextSignals::none(),
            optimizer: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn signals(mut self, signals: ContextSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Defaults to pass-through.
    pub fn optimizer(mut self, optimizer: UpdateOptimizer<T>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Source of transition timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<AdaptiveCell<T>> {
        let log = TransitionLog::new(self.history_capacity)?;
        let cell = Cell::new(&self.context, self.initial);
        let optimizer = self.optimizer.unwrap_or_else(UpdateOptimizer::pass_through);
        Ok(AdaptiveCell::assemble(cell, log, self.signals, optimizer, self.clock))
    }
}
