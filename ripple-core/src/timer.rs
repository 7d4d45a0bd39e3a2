//! Clocks and Timers
//!
//! Optimizers that defer or rate-limit writes need to know the time and to
//! resume later. Both needs go through the traits in this module so the
//! same optimizer runs against wall-clock time in an application and
//! against virtual time in tests.
//!
//! - [`SystemClock`]: `Instant::now()`, no timers.
//! - [`ManualScheduler`]: virtual time that only moves when [`ManualScheduler::advance`]
//!   is called. Due tasks run synchronously inside `advance`, in due order.
//! - [`TokioScheduler`]: tasks run on a tokio runtime after `tokio::time::sleep`.
//!   Time comes from `tokio::time::Instant`, so paused-time tests work.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Runs tasks after a delay.
pub trait Scheduler: Clock {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a scheduled task. Returns `false` if it already ran or was
    /// cancelled.
    fn cancel(&self, id: TimerId) -> bool;

    /// Number of tasks waiting to run.
    fn pending(&self) -> usize;
}

/// Identifier of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

// ----------------------------------------------------------------------------
// Manual scheduler
// ----------------------------------------------------------------------------

struct ManualState {
    origin: Instant,
    elapsed: Duration,
    queue: BTreeMap<(Duration, TimerId), Task>,
    due: HashMap<TimerId, Duration>,
}

/// Deterministic virtual-time scheduler.
///
/// Cloning yields another handle to the same timeline.
#[derive(Clone)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                queue: BTreeMap::new(),
                due: HashMap::new(),
            })),
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Move time forward by `by`, running every task that falls due.
    ///
    /// Tasks run without the scheduler locked, so a task may schedule or
    /// cancel others. A task scheduled inside the window also runs if it
    /// falls due before the window closes. Returns the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().elapsed + by;
        let mut ran = 0;

        loop {
            let next = {
                let mut state = self.state.lock();
                let key = match state.queue.keys().next() {
                    Some(&(due, id)) if due <= target => (due, id),
                    _ => break,
                };
                state.due.remove(&key.1);
                state.elapsed = state.elapsed.max(key.0);
                state.queue.remove(&key)
            };
            if let Some(task) = next {
                task();
                ran += 1;
            }
        }

        let mut state = self.state.lock();
        state.elapsed = state.elapsed.max(target);
        ran
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualScheduler {
    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.origin + state.elapsed
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId::new();
        let mut state = self.state.lock();
        let due = state.elapsed + delay;
        state.queue.insert((due, id), task);
        state.due.insert(id, due);
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.state.lock();
        match state.due.remove(&id) {
            Some(due) => state.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualScheduler")
            .field("elapsed", &state.elapsed)
            .field("pending", &state.queue.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tokio scheduler
// ----------------------------------------------------------------------------

/// Scheduler backed by a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
    timers: Arc<Mutex<HashMap<TimerId, AbortHandle>>>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::Config(format!("no tokio runtime available: {e}")))
    }
}

impl Clock for TokioScheduler {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerId {
        let id = TimerId::new();
        let timers = Arc::clone(&self.timers);

        // Hold the map while spawning so the task cannot look itself up
        // before it has been registered.
        let mut guard = self.timers.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let registered = timers.lock().remove(&id).is_some();
            if registered {
                task();
            }
        });
        guard.insert(id, join.abort_handle());
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        match self.timers.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
