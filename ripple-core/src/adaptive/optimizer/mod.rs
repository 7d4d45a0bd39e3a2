//! Update Optimizers
//!
//! An optimizer sits between a proposed write and the cell it targets and
//! decides what, if anything, gets committed right now. The set of
//! strategies is closed:
//!
//! - Pass-through: every proposal commits as-is.
//! - [`Debounce`]: bursts collapse into one trailing commit.
//! - [`Throttle`]: at most one commit per interval, the rest are dropped.
//! - [`Predictive`]: may commit a learned next value instead of the proposal.
//!
//! Optimizers are stateful and belong to exactly one cell. The signal
//! snapshot they consult is swapped in with
//! [`UpdateOptimizer::with_context_signals`] before each call; per-call state
//! (pending values, last commit time, learned patterns) survives the swap.

mod debounce;
mod predictive;
mod throttle;

pub use debounce::{Debounce, MAX_DELAY, MIN_DELAY};
pub use predictive::{Predictive, PredictiveConfig, MAX_THRESHOLD, MIN_THRESHOLD};
pub use throttle::{Throttle, MIN_INTERVAL};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::signal::ContextSnapshot;
use super::transition::TransitionLog;
use crate::error::{Error, Result};
use crate::timer::{Clock, Scheduler};

/// What an optimizer decided to do with a proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<T> {
    /// Commit this value now. It may differ from the proposal.
    Commit(T),
    /// Buffered; a later commit goes through the bound [`CommitHandler`].
    Deferred,
    /// Refused and forgotten.
    Dropped,
}

impl<T> Decision<T> {
    pub fn committed(&self) -> Option<&T> {
        match self {
            Decision::Commit(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit(_))
    }
}

pub(crate) fn next_optimizer_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Receives values committed outside of `optimize`, such as a debounce firing.
pub type CommitHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimizerKind {
    PassThrough,
    Debounce,
    Throttle,
    Predictive,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::PassThrough => "pass_through",
            OptimizerKind::Debounce => "debounce",
            OptimizerKind::Throttle => "throttle",
            OptimizerKind::Predictive => "predictive",
        }
    }
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy behind an [`UpdateOptimizer`].
#[derive(Debug)]
pub enum Strategy<T> {
    PassThrough,
    Debounce(Debounce<T>),
    Throttle(Throttle),
    Predictive(Predictive<T>),
}

/// A strategy plus the signal snapshot it currently sees.
#[derive(Debug)]
pub struct UpdateOptimizer<T> {
    id: u64,
    strategy: Strategy<T>,
    context: ContextSnapshot,
    disposed: bool,
}

impl<T> UpdateOptimizer<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(strategy: Strategy<T>) -> Self {
        let id = match &strategy {
            Strategy::Debounce(debounce) => debounce.id(),
            _ => next_optimizer_id(),
        };
        Self {
            id,
            strategy,
            context: ContextSnapshot::new(),
            disposed: false,
        }
    }

    pub fn pass_through() -> Self {
        Self::new(Strategy::PassThrough)
    }

    pub fn debounce(duration: Duration, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        Ok(Self::new(Strategy::Debounce(Debounce::new(duration, scheduler)?)))
    }

    pub fn throttle(interval: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(Strategy::Throttle(Throttle::new(interval, clock)?)))
    }

    pub fn predictive(config: PredictiveConfig) -> Result<Self> {
        Ok(Self::new(Strategy::Predictive(Predictive::new(config)?)))
    }

    /// Identifier reported in [`Error::Disposed`].
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OptimizerKind {
        match &self.strategy {
            Strategy::PassThrough => OptimizerKind::PassThrough,
            Strategy::Debounce(_) => OptimizerKind::Debounce,
            Strategy::Throttle(_) => OptimizerKind::Throttle,
            Strategy::Predictive(_) => OptimizerKind::Predictive,
        }
    }

    pub fn strategy(&self) -> &Strategy<T> {
        &self.strategy
    }

    /// The snapshot the next `optimize` call will consult.
    pub fn context(&self) -> &ContextSnapshot {
        &self.context
    }

    /// Return this optimizer configured with `context`.
    pub fn with_context_signals(mut self, context: ContextSnapshot) -> Self {
        self.context = context;
        self
    }

    /// Route deferred commits to `handler`. Strategies that never defer
    /// ignore it.
    pub fn bind_commit(&self, handler: CommitHandler<T>) {
        if let Strategy::Debounce(debounce) = &self.strategy {
            debounce.bind_commit(handler);
        }
    }

    /// Decide what to do with `proposed`.
    ///
    /// `history` holds every proposal so far, ending with this one.
    pub fn optimize(&mut self, proposed: T, history: &TransitionLog<T>) -> Result<Decision<T>> {
        self.ensure_live()?;
        match &mut self.strategy {
            Strategy::PassThrough => Ok(Decision::Commit(proposed)),
            Strategy::Debounce(debounce) => debounce.optimize(proposed, &self.context),
            Strategy::Throttle(throttle) => Ok(throttle.optimize(proposed, &self.context)),
            Strategy::Predictive(predictive) => predictive.optimize(proposed, history, &self.context),
        }
    }

    /// Take the buffered value, if any, cancelling its scheduled commit.
    pub fn flush(&mut self) -> Result<Option<T>> {
        self.ensure_live()?;
        match &self.strategy {
            Strategy::Debounce(debounce) => debounce.flush(),
            _ => Ok(None),
        }
    }

    /// Release timers and buffered values. Calling this again is a no-op.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Strategy::Debounce(debounce) = &self.strategy {
            debounce.dispose();
        }
        tracing::debug!(kind = %self.kind(), "optimizer disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Same strategy and configuration, none of the accumulated state.
    pub fn fresh(&self) -> Self {
        let strategy = match &self.strategy {
            Strategy::PassThrough => Strategy::PassThrough,
            Strategy::Debounce(debounce) => Strategy::Debounce(debounce.fresh()),
            Strategy::Throttle(throttle) => Strategy::Throttle(throttle.fresh()),
            Strategy::Predictive(predictive) => Strategy::Predictive(predictive.fresh()),
        };
        Self::new(strategy)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(Error::disposed("optimizer", self.id))
        } else {
            Ok(())
        }
    }
}

impl<T> Drop for UpdateOptimizer<T> {
    fn drop(&mut self) {
        if let Strategy::Debounce(debounce) = &self.strategy {
            debounce.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::signal::PERFORMANCE;
    use crate::timer::ManualScheduler;
    use std::time::Instant;

    fn history_with(values: &[i32]) -> TransitionLog<i32> {
        let mut log = TransitionLog::new(16).unwrap();
        for &value in values {
            log.record(0, value, Instant::now(), ContextSnapshot::new());
        }
        log
    }

    #[test]
    fn pass_through_commits_proposal() {
        let mut optimizer = UpdateOptimizer::pass_through();
        let log = history_with(&[1]);
        assert_eq!(optimizer.optimize(1, &log).unwrap(), Decision::Commit(1));
        assert_eq!(optimizer.flush().unwrap(), None);
        assert_eq!(optimizer.kind(), OptimizerKind::PassThrough);
    }

    #[test]
    fn disposed_optimizer_fails_fast() {
        let mut optimizer = UpdateOptimizer::pass_through();
        optimizer.dispose();
        optimizer.dispose();

        assert!(optimizer.is_disposed());
        let log = history_with(&[1]);
        assert_eq!(
            optimizer.optimize(1, &log).unwrap_err(),
            Error::Disposed {
                kind: "optimizer",
                id: optimizer.id()
            }
        );
        assert!(optimizer.flush().is_err());
    }

    #[test]
    fn reconfiguring_keeps_throttle_window() {
        let clock = ManualScheduler::new();
        let mut optimizer = UpdateOptimizer::throttle(Duration::from_millis(100), Arc::new(clock.clone())).unwrap();
        let log = history_with(&[1]);

        assert_eq!(optimizer.optimize(1, &log).unwrap(), Decision::Commit(1));
        clock.advance(Duration::from_millis(120));

        // A sluggish renderer stretches the window to 200ms.
        let slow: ContextSnapshot = [(PERFORMANCE, 0.0)].into_iter().collect();
        let mut optimizer = optimizer.with_context_signals(slow);
        assert_eq!(optimizer.optimize(2, &log).unwrap(), Decision::Dropped);

        let mut optimizer = optimizer.with_context_signals(ContextSnapshot::new());
        assert_eq!(optimizer.optimize(3, &log).unwrap(), Decision::Commit(3));
    }

    #[test]
    fn flush_hands_back_debounced_value() {
        let scheduler = ManualScheduler::new();
        let mut optimizer = UpdateOptimizer::debounce(Duration::from_millis(100), Arc::new(scheduler.clone())).unwrap();
        let log = history_with(&[1, 2]);

        assert!(optimizer.optimize(1, &log).unwrap().is_commit());
        assert_eq!(optimizer.optimize(2, &log).unwrap(), Decision::Deferred);
        assert_eq!(optimizer.flush().unwrap(), Some(2));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn dropping_cancels_scheduled_commit() {
        let scheduler = ManualScheduler::new();
        let mut optimizer = UpdateOptimizer::debounce(Duration::from_millis(100), Arc::new(scheduler.clone())).unwrap();
        let log = history_with(&[1, 2]);

        optimizer.optimize(1, &log).unwrap();
        optimizer.optimize(2, &log).unwrap();
        assert_eq!(scheduler.pending(), 1);

        drop(optimizer);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn fresh_keeps_strategy_only() {
        let mut optimizer = UpdateOptimizer::<i32>::predictive(PredictiveConfig::default()).unwrap();
        optimizer.dispose();

        let fresh = optimizer.fresh();
        assert_eq!(fresh.kind(), OptimizerKind::Predictive);
        assert!(!fresh.is_disposed());
        assert!(fresh.context().is_empty());
    }

    #[test]
    fn optimizers_get_distinct_ids() {
        let a = UpdateOptimizer::<i32>::pass_through();
        let b = UpdateOptimizer::<i32>::pass_through();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.fresh().id(), a.id());

        let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
        let debounce = Debounce::<i32>::new(Duration::from_millis(100), scheduler).unwrap();
        let debounce_id = debounce.id();
        assert_eq!(UpdateOptimizer::new(Strategy::Debounce(debounce)).id(), debounce_id);
    }

    #[test]
    fn decision_accessors() {
        assert_eq!(Decision::Commit(4).committed(), Some(&4));
        assert_eq!(Decision::<i32>::Deferred.committed(), None);
        assert!(!Decision::<i32>::Dropped.is_commit());
    }
}
