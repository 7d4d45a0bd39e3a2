//! Context Signals
//!
//! A context signal is an external scalar in `[0, 1]` describing the
//! environment: battery charge, rendering headroom, network quality. Optimizers
//! read a snapshot of the signals attached to their cell and scale their
//! timing or confidence accordingly. `1.0` always means "plentiful".
//!
//! Signals are typically shared: one battery provider may feed every
//! debounced cell in an application. Cells only ever read them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known signal name read by debounce and throttle.
pub const BATTERY: &str = "battery";
/// Well-known signal name read by throttle.
pub const PERFORMANCE: &str = "performance";
/// Well-known signal name read by throttle.
pub const NETWORK: &str = "network";

/// Provider of a single context value.
pub trait ContextSignal: Send + Sync {
    fn name(&self) -> &str;

    /// Current reading, expected in `[0, 1]`.
    fn value(&self) -> f64;

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn dispose(&self) {}
}

fn check_range(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::SignalOutOfRange {
            name: name.to_string(),
            value,
        })
    }
}

/// A signal whose value is pushed by the application.
#[derive(Debug)]
pub struct ManualSignal {
    name: String,
    bits: AtomicU64,
    initialized: AtomicBool,
}

impl ManualSignal {
    pub fn new(name: impl Into<String>, value: f64) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptySignalName);
        }
        check_range(&name, value)?;
        Ok(Self {
            name,
            bits: AtomicU64::new(value.to_bits()),
            initialized: AtomicBool::new(false),
        })
    }

    /// Publish a new reading.
    pub fn set(&self, value: f64) -> Result<()> {
        check_range(&self.name, value)?;
        self.bits.store(value.to_bits(), Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

impl ContextSignal for ManualSignal {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn dispose(&self) {
        self.initialized.store(false, Ordering::Release);
    }
}

/// Signal readings captured at one instant, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot(BTreeMap<String, f64>);

impl ContextSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Average reading across all signals, `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.values().sum::<f64>() / self.0.len() as f64)
        }
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for ContextSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(name, value)| (name.into(), value)).collect())
    }
}

/// The validated set of signals attached to an adaptive cell.
#[derive(Clone, Default)]
pub struct ContextSignals {
    signals: IndexMap<String, Arc<dyn ContextSignal>>,
}

impl ContextSignals {
    /// An empty set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Validate and collect `signals`.
    ///
    /// Rejects empty names, duplicate names and current readings outside
    /// `[0, 1]`.
    pub fn new<I>(signals: I) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<dyn ContextSignal>>,
    {
        signals.into_iter().try_fold(Self::none(), Self::with)
    }

    /// Add one more signal, validating it against the set.
    pub fn with(mut self, signal: Arc<dyn ContextSignal>) -> Result<Self> {
        let name = signal.name().to_string();
        if name.is_empty() {
            return Err(Error::EmptySignalName);
        }
        if self.signals.contains_key(&name) {
            return Err(Error::DuplicateSignal(name));
        }
        check_range(&name, signal.value())?;
        self.signals.insert(name, signal);
        Ok(self)
    }

    /// Initialize every provider, stopping at the first failure.
    pub fn initialize(&self) -> Result<()> {
        for (name, signal) in &self.signals {
            signal.initialize().map_err(|e| Error::SignalInit {
                name: name.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn dispose(&self) {
        for signal in self.signals.values() {
            signal.dispose();
        }
    }

    /// Read every signal now.
    ///
    /// Readings that drifted out of range after validation are clamped;
    /// non-finite readings are skipped.
    pub fn snapshot(&self) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::new();
        for (name, signal) in &self.signals {
            let value = signal.value();
            if value.is_nan() {
                tracing::warn!(signal = %name, "context signal reported NaN, skipped");
                continue;
            }
            if !(0.0..=1.0).contains(&value) {
                tracing::warn!(signal = %name, value, "context signal out of range, clamped");
            }
            snapshot.insert(name.clone(), value.clamp(0.0, 1.0));
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ContextSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.signals.iter().map(|(name, signal)| (name, signal.value())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(name: &str, value: f64) -> Arc<dyn ContextSignal> {
        Arc::new(ManualSignal::new(name, value).unwrap())
    }

    struct Drifting;

    impl ContextSignal for Drifting {
        fn name(&self) -> &str {
            "drifting"
        }

        fn value(&self) -> f64 {
            1.5
        }
    }

    #[test]
    fn rejects_invalid_manual_signals() {
        assert_eq!(ManualSignal::new("", 0.5).unwrap_err(), Error::EmptySignalName);
        assert!(matches!(
            ManualSignal::new(BATTERY, 1.2),
            Err(Error::SignalOutOfRange { .. })
        ));
        assert!(ManualSignal::new(BATTERY, f64::NAN).is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = ContextSignals::new([signal(BATTERY, 0.5), signal(BATTERY, 0.7)]).unwrap_err();
        assert_eq!(err, Error::DuplicateSignal(BATTERY.to_string()));
    }

    #[test]
    fn rejects_out_of_range_provider() {
        let err = ContextSignals::new([Arc::new(Drifting) as Arc<dyn ContextSignal>]).unwrap_err();
        assert!(matches!(err, Error::SignalOutOfRange { value, .. } if value == 1.5));
    }

    #[test]
    fn snapshot_reads_current_values() {
        let battery = Arc::new(ManualSignal::new(BATTERY, 0.8).unwrap());
        let signals = ContextSignals::new([
            battery.clone() as Arc<dyn ContextSignal>,
            signal(NETWORK, 0.4),
        ])
        .unwrap();

        battery.set(0.2).unwrap();
        let snapshot = signals.snapshot();
        assert_eq!(snapshot.get(BATTERY), Some(0.2));
        assert_eq!(snapshot.get(NETWORK), Some(0.4));
        assert_eq!(snapshot.get(PERFORMANCE), None);
        assert!((snapshot.mean().unwrap() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn lifecycle_is_forwarded() {
        let battery = Arc::new(ManualSignal::new(BATTERY, 1.0).unwrap());
        let signals = ContextSignals::new([battery.clone() as Arc<dyn ContextSignal>]).unwrap();

        signals.initialize().unwrap();
        assert!(battery.is_initialized());
        signals.dispose();
        assert!(!battery.is_initialized());
    }

    #[test]
    fn snapshot_serializes_as_a_map() {
        let snapshot: ContextSnapshot = [(BATTERY, 0.5)].into_iter().collect();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"battery":0.5}"#);
    }
}
