//! Throttle
//!
//! Commits at most one proposal per interval. Proposals arriving inside the
//! interval are dropped outright; unlike debounce, nothing is remembered.
//!
//! The interval lengthens as the environment degrades. Each present signal
//! `s` multiplies it by `1 + w·(1 − s)`, with weights 1.0 for `performance`
//! and 0.5 for `battery` and `network`. The result never drops below
//! [`MIN_INTERVAL`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Decision;
use crate::adaptive::signal::{ContextSnapshot, BATTERY, NETWORK, PERFORMANCE};
use crate::error::{Error, Result};
use crate::timer::Clock;

/// Floor for the effective interval, one 60 Hz frame.
pub const MIN_INTERVAL: Duration = Duration::from_millis(16);

const WEIGHTS: [(&str, f64); 3] = [(PERFORMANCE, 1.0), (BATTERY, 0.5), (NETWORK, 0.5)];

/// Leading-edge rate limiter.
pub struct Throttle {
    interval: Duration,
    allow_first_update: bool,
    clock: Arc<dyn Clock>,
    started: bool,
    last_commit: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidDuration("throttle interval"));
        }
        Ok(Self {
            interval,
            allow_first_update: true,
            clock,
            started: false,
            last_commit: None,
        })
    }

    /// Whether the very first proposal commits. When disabled, the first
    /// proposal only opens the window.
    pub fn allow_first_update(mut self, allow: bool) -> Self {
        self.allow_first_update = allow;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn effective_interval(&self, context: &ContextSnapshot) -> Duration {
        let factor = WEIGHTS
            .iter()
            .filter_map(|(name, weight)| context.get(name).map(|s| 1.0 + weight * (1.0 - s)))
            .product::<f64>();
        self.interval.mul_f64(factor).max(MIN_INTERVAL)
    }

    pub fn optimize<T>(&mut self, proposed: T, context: &ContextSnapshot) -> Decision<T> {
        let now = self.clock.now();

        if !self.started {
            self.started = true;
            self.last_commit = Some(now);
            return if self.allow_first_update {
                Decision::Commit(proposed)
            } else {
                Decision::Dropped
            };
        }

        let interval = self.effective_interval(context);
        let ready = match self.last_commit {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        };
        if ready {
            self.last_commit = Some(now);
            Decision::Commit(proposed)
        } else {
            tracing::trace!(?interval, "throttled proposal dropped");
            Decision::Dropped
        }
    }

    pub fn fresh(&self) -> Self {
        Self {
            interval: self.interval,
            allow_first_update: self.allow_first_update,
            clock: Arc::clone(&self.clock),
            started: false,
            last_commit: None,
        }
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("interval", &self.interval)
            .field("allow_first_update", &self.allow_first_update)
            .field("last_commit", &self.last_commit)
            .finish()
    }
}
