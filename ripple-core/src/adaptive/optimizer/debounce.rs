//! Debounce
//!
//! The first proposal commits immediately. Every later proposal replaces the
//! pending value and restarts the timer; when the timer fires, the last
//! pending value is committed through the bound commit handler. A burst of
//! proposals therefore produces one commit, carrying the last value.
//!
//! The delay stretches when the battery runs low: with a `battery` reading
//! `b > 0` the delay is `duration / b`, clamped to
//! [`MIN_DELAY`]..=[`MAX_DELAY`]. Only the scaled delay is clamped; without
//! a positive battery reading the configured duration is used as-is, so a
//! 10ms debounce stays at 10ms.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::{next_optimizer_id, CommitHandler, Decision};
use crate::adaptive::signal::{ContextSnapshot, BATTERY};
use crate::error::{Error, Result};
use crate::timer::{Scheduler, TimerId};

/// Shortest delay after battery scaling.
pub const MIN_DELAY: Duration = Duration::from_millis(50);
/// Longest delay after battery scaling.
pub const MAX_DELAY: Duration = Duration::from_millis(5000);

struct DebounceState<T> {
    primed: bool,
    pending: Option<T>,
    timer: Option<TimerId>,
    commit: Option<CommitHandler<T>>,
    disposed: bool,
}

/// Trailing-edge debounce with an immediate first commit.
pub struct Debounce<T> {
    id: u64,
    duration: Duration,
    scheduler: Arc<dyn Scheduler>,
    state: Arc<Mutex<DebounceState<T>>>,
}

impl<T> Debounce<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(duration: Duration, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::InvalidDuration("debounce duration"));
        }
        Ok(Self {
            id: next_optimizer_id(),
            duration,
            scheduler,
            state: Arc::new(Mutex::new(DebounceState {
                primed: false,
                pending: None,
                timer: None,
                commit: None,
                disposed: false,
            })),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Delay used for the next schedule under `context`.
    pub fn effective_duration(&self, context: &ContextSnapshot) -> Duration {
        match context.get(BATTERY) {
            Some(battery) if battery > 0.0 => {
                let secs = (self.duration.as_secs_f64() / battery).min(MAX_DELAY.as_secs_f64());
                Duration::from_secs_f64(secs).max(MIN_DELAY)
            }
            _ => self.duration,
        }
    }

    /// Register where deferred values are committed.
    pub fn bind_commit(&self, handler: CommitHandler<T>) {
        self.state.lock().commit = Some(handler);
    }

    pub fn optimize(&self, proposed: T, context: &ContextSnapshot) -> Result<Decision<T>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::disposed("debounce optimizer", self.id));
        }
        if !state.primed {
            state.primed = true;
            return Ok(Decision::Commit(proposed));
        }

        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.pending = Some(proposed);

        let delay = self.effective_duration(context);
        let weak = Arc::downgrade(&self.state);
        // The timer id is only known after scheduling. The slot is filled
        // while the state lock is held, and `fire` reads it under that lock.
        let slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));
        let task_slot = Arc::clone(&slot);
        let timer = self
            .scheduler
            .schedule(delay, Box::new(move || fire(&weak, &task_slot)));
        *slot.lock() = Some(timer);
        state.timer = Some(timer);
        tracing::debug!(?delay, "debounced proposal deferred");
        Ok(Decision::Deferred)
    }

    /// Cancel the schedule and hand back the pending value, if any.
    pub fn flush(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(Error::disposed("debounce optimizer", self.id));
        }
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        Ok(state.pending.take())
    }

    pub fn pending(&self) -> Option<T> {
        self.state.lock().pending.clone()
    }

    pub fn has_scheduled_commit(&self) -> bool {
        self.state.lock().timer.is_some()
    }

    /// Cancel any schedule and drop the pending value without committing.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        if let Some(timer) = state.timer.take() {
            self.scheduler.cancel(timer);
        }
        state.pending = None;
        state.commit = None;
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Same configuration, clean state.
    pub fn fresh(&self) -> Self {
        Self {
            id: next_optimizer_id(),
            duration: self.duration,
            scheduler: Arc::clone(&self.scheduler),
            state: Arc::new(Mutex::new(DebounceState {
                primed: false,
                pending: None,
                timer: None,
                commit: None,
                disposed: false,
            })),
        }
    }
}

impl<T> Debounce<T> {
    /// Cancel the scheduled commit, keeping the pending value.
    pub(crate) fn cancel(&self) {
        if let Some(timer) = self.state.lock().timer.take() {
            self.scheduler.cancel(timer);
        }
    }
}

fn fire<T>(state: &Weak<Mutex<DebounceState<T>>>, slot: &Mutex<Option<TimerId>>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let (value, commit) = {
        let mut guard = state.lock();
        let timer = *slot.lock();
        if guard.disposed || timer.is_none() || guard.timer != timer {
            return;
        }
        guard.timer = None;
        (guard.pending.take(), guard.commit.clone())
    };

    match (value, commit) {
        (Some(value), Some(commit)) => {
            tracing::debug!("debounced value committed");
            commit(value);
        }
        (Some(_), None) => tracing::warn!("debounce fired without a commit handler, value dropped"),
        _ => {}
    }
}

impl<T> std::fmt::Debug for Debounce<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Debounce")
            .field("id", &self.id)
            .field("duration", &self.duration)
            .field("pending", &state.pending.is_some())
            .field("disposed", &state.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::{Clock, ManualScheduler, Task};

    fn setup(ms: u64) -> (ManualScheduler, Debounce<i32>, Arc<Mutex<Vec<i32>>>) {
        let scheduler = ManualScheduler::new();
        let (debounce, committed) = bound(ms, Arc::new(scheduler.clone()));
        (scheduler, debounce, committed)
    }

    fn bound(ms: u64, scheduler: Arc<dyn Scheduler>) -> (Debounce<i32>, Arc<Mutex<Vec<i32>>>) {
        let debounce = Debounce::new(Duration::from_millis(ms), scheduler).unwrap();
        let committed = Arc::new(Mutex::new(Vec::new()));
        let sink = committed.clone();
        debounce.bind_commit(Arc::new(move |v| sink.lock().push(v)));
        (debounce, committed)
    }

    /// Virtual time whose timers cannot be cancelled once queued.
    struct Uncancellable(ManualScheduler);

    impl Clock for Uncancellable {
        fn now(&self) -> std::time::Instant {
            self.0.now()
        }
    }

    impl Scheduler for Uncancellable {
        fn schedule(&self, delay: Duration, task: Task) -> TimerId {
            self.0.schedule(delay, task)
        }

        fn cancel(&self, _id: TimerId) -> bool {
            false
        }

        fn pending(&self) -> usize {
            self.0.pending()
        }
    }

    #[test]
    fn zero_duration_is_rejected() {
        let scheduler: Arc<dyn Scheduler> = Arc::new(ManualScheduler::new());
        assert!(matches!(
            Debounce::<i32>::new(Duration::ZERO, scheduler),
            Err(Error::InvalidDuration(_))
        ));
    }

    #[test]
    fn first_call_commits_then_burst_collapses_to_last() {
        let (scheduler, debounce, committed) = setup(100);
        let ctx = ContextSnapshot::new();

        assert_eq!(debounce.optimize(1, &ctx).unwrap(), Decision::Commit(1));
        assert_eq!(debounce.optimize(2, &ctx).unwrap(), Decision::Deferred);
        scheduler.advance(Duration::from_millis(10));
        assert_eq!(debounce.optimize(3, &ctx).unwrap(), Decision::Deferred);

        scheduler.advance(Duration::from_millis(99));
        assert!(committed.lock().is_empty());
        assert_eq!(debounce.pending(), Some(3));

        scheduler.advance(Duration::from_millis(1));
        assert_eq!(*committed.lock(), vec![3]);
        assert_eq!(debounce.pending(), None);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn flush_returns_pending_and_cancels_timer() {
        let (scheduler, debounce, committed) = setup(100);
        let ctx = ContextSnapshot::new();

        debounce.optimize(1, &ctx).unwrap();
        debounce.optimize(2, &ctx).unwrap();
        assert_eq!(debounce.flush().unwrap(), Some(2));
        assert!(!debounce.has_scheduled_commit());

        scheduler.advance(Duration::from_secs(1));
        assert!(committed.lock().is_empty());
        assert_eq!(debounce.flush().unwrap(), None);
    }

    #[test]
    fn dispose_drops_pending_without_commit() {
        let (scheduler, debounce, committed) = setup(100);
        let ctx = ContextSnapshot::new();

        debounce.optimize(1, &ctx).unwrap();
        debounce.optimize(2, &ctx).unwrap();
        debounce.dispose();
        debounce.dispose();

        scheduler.advance(Duration::from_secs(1));
        assert!(committed.lock().is_empty());
        assert!(matches!(debounce.optimize(3, &ctx), Err(Error::Disposed { .. })));
        assert!(debounce.flush().is_err());
    }

    #[test]
    fn timer_firing_after_dispose_commits_nothing() {
        let scheduler = ManualScheduler::new();
        let (debounce, committed) = bound(100, Arc::new(Uncancellable(scheduler.clone())));
        let ctx = ContextSnapshot::new();

        debounce.optimize(1, &ctx).unwrap();
        debounce.optimize(2, &ctx).unwrap();
        debounce.dispose();
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert!(committed.lock().is_empty());
        assert_eq!(debounce.pending(), None);
    }

    #[test]
    fn superseded_timer_is_ignored() {
        let scheduler = ManualScheduler::new();
        let (debounce, committed) = bound(100, Arc::new(Uncancellable(scheduler.clone())));
        let ctx = ContextSnapshot::new();

        assert_eq!(debounce.optimize(1, &ctx).unwrap(), Decision::Commit(1));
        assert_eq!(debounce.optimize(2, &ctx).unwrap(), Decision::Deferred);
        scheduler.advance(Duration::from_millis(50));
        assert_eq!(debounce.optimize(3, &ctx).unwrap(), Decision::Deferred);
        assert_eq!(scheduler.pending(), 2);

        // The first timer is due at 100ms and still runs.
        assert_eq!(scheduler.advance(Duration::from_millis(50)), 1);
        assert!(committed.lock().is_empty());
        assert_eq!(debounce.pending(), Some(3));
        assert!(debounce.has_scheduled_commit());

        assert_eq!(scheduler.advance(Duration::from_millis(50)), 1);
        assert_eq!(*committed.lock(), vec![3]);
        assert!(!debounce.has_scheduled_commit());
    }

    #[test]
    fn disposed_error_carries_instance_id() {
        let (_, debounce, _) = setup(100);
        debounce.dispose();
        assert_eq!(
            debounce.optimize(1, &ContextSnapshot::new()).unwrap_err(),
            Error::Disposed {
                kind: "debounce optimizer",
                id: debounce.id()
            }
        );
        assert_ne!(debounce.fresh().id(), debounce.id());
    }

    #[test]
    fn battery_stretches_and_clamps_delay() {
        let (_, debounce, _) = setup(100);

        let half: ContextSnapshot = [(BATTERY, 0.5)].into_iter().collect();
        assert_eq!(debounce.effective_duration(&half), Duration::from_millis(200));

        let nearly_empty: ContextSnapshot = [(BATTERY, 0.001)].into_iter().collect();
        assert_eq!(debounce.effective_duration(&nearly_empty), MAX_DELAY);

        let empty: ContextSnapshot = [(BATTERY, 0.0)].into_iter().collect();
        assert_eq!(debounce.effective_duration(&empty), Duration::from_millis(100));

        let (_, short, _) = setup(10);
        let full: ContextSnapshot = [(BATTERY, 1.0)].into_iter().collect();
        assert_eq!(short.effective_duration(&full), MIN_DELAY);
        assert_eq!(short.effective_duration(&ContextSnapshot::new()), Duration::from_millis(10));
    }

    #[test]
    fn fresh_instance_starts_unprimed() {
        let (_, debounce, _) = setup(100);
        let ctx = ContextSnapshot::new();
        debounce.optimize(1, &ctx).unwrap();

        let fresh = debounce.fresh();
        assert_eq!(fresh.optimize(5, &ctx).unwrap(), Decision::Commit(5));
    }
}
