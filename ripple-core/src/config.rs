//! Optimizer and adaptive cell configuration.
//!
//! Configuration is plain data that can be loaded from JSON:
//!
//! ```json
//! {
//!   "history_capacity": 32,
//!   "optimizer": { "strategy": "debounce", "duration_ms": 250 }
//! }
//! ```
//!
//! Validation happens when the configuration is turned into an optimizer, so
//! a zero duration or an empty dictionary is reported as the same error a
//! direct constructor call would return.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adaptive::{PredictiveConfig, Strategy, Throttle, UpdateOptimizer, DEFAULT_HISTORY_CAPACITY};
use crate::error::Result;
use crate::timer::{Clock, Scheduler};

/// Which optimizer to build, and its parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum OptimizerConfig {
    #[default]
    PassThrough,
    Debounce {
        duration_ms: u64,
    },
    Throttle {
        interval_ms: u64,
        #[serde(default = "default_allow_first_update")]
        allow_first_update: bool,
    },
    Predictive(PredictiveConfig),
}

fn default_allow_first_update() -> bool {
    true
}

impl OptimizerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Build a fresh optimizer. Debounce schedules on `scheduler`; throttle
    /// reads time from it.
    pub fn build<T, S>(&self, scheduler: &Arc<S>) -> Result<UpdateOptimizer<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        S: Scheduler + 'static,
    {
        match self {
            OptimizerConfig::PassThrough => Ok(UpdateOptimizer::pass_through()),
            OptimizerConfig::Debounce { duration_ms } => UpdateOptimizer::debounce(
                Duration::from_millis(*duration_ms),
                Arc::clone(scheduler) as Arc<dyn Scheduler>,
            ),
            OptimizerConfig::Throttle {
                interval_ms,
                allow_first_update,
            } => {
                let throttle = Throttle::new(
                    Duration::from_millis(*interval_ms),
                    Arc::clone(scheduler) as Arc<dyn Clock>,
                )?;
                Ok(UpdateOptimizer::new(Strategy::Throttle(
                    throttle.allow_first_update(*allow_first_update),
                )))
            }
            OptimizerConfig::Predictive(config) => UpdateOptimizer::predictive(config.clone()),
        }
    }
}

impl PredictiveConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Configuration of one adaptive cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl AdaptiveConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::OptimizerKind;
    use crate::error::Error;
    use crate::timer::ManualScheduler;

    #[test]
    fn parses_tagged_strategies() {
        let config = AdaptiveConfig::from_json(
            r#"{ "history_capacity": 8, "optimizer": { "strategy": "debounce", "duration_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.history_capacity, 8);
        assert_eq!(config.optimizer, OptimizerConfig::Debounce { duration_ms: 250 });

        let throttle = OptimizerConfig::from_json(r#"{ "strategy": "throttle", "interval_ms": 16 }"#).unwrap();
        assert_eq!(
            throttle,
            OptimizerConfig::Throttle {
                interval_ms: 16,
                allow_first_update: true
            }
        );
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config = AdaptiveConfig::from_json("{}").unwrap();
        assert_eq!(config, AdaptiveConfig::default());

        let predictive =
            OptimizerConfig::from_json(r#"{ "strategy": "predictive", "max_patterns": 32 }"#).unwrap();
        let OptimizerConfig::Predictive(predictive) = predictive else {
            panic!("expected predictive config");
        };
        assert_eq!(predictive.max_patterns, 32);
        assert_eq!(predictive.max_pattern_length, 4);
        assert_eq!(predictive.confidence_threshold, 0.7);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = OptimizerConfig::from_json(r#"{ "strategy": "telepathy" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn build_validates_parameters() {
        let scheduler = Arc::new(ManualScheduler::new());
        let zero = OptimizerConfig::Debounce { duration_ms: 0 };
        assert!(matches!(
            zero.build::<i32, _>(&scheduler),
            Err(Error::InvalidDuration(_))
        ));

        let err = PredictiveConfig::from_json(r#"{ "max_pattern_length": 1 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
    }

    #[test]
    fn build_selects_strategy() {
        let scheduler = Arc::new(ManualScheduler::new());
        let cases = [
            (OptimizerConfig::PassThrough, OptimizerKind::PassThrough),
            (OptimizerConfig::Debounce { duration_ms: 100 }, OptimizerKind::Debounce),
            (
                OptimizerConfig::Throttle {
                    interval_ms: 100,
                    allow_first_update: false,
                },
                OptimizerKind::Throttle,
            ),
            (OptimizerConfig::Predictive(PredictiveConfig::default()), OptimizerKind::Predictive),
        ];
        for (config, kind) in cases {
            assert_eq!(config.build::<i32, _>(&scheduler).unwrap().kind(), kind);
        }
    }

    #[test]
    fn round_trips_through_json() {
        let config = AdaptiveConfig {
            history_capacity: 16,
            optimizer: OptimizerConfig::Throttle {
                interval_ms: 50,
                allow_first_update: false,
            },
        };
        let json = config.to_json().unwrap();
        assert!(json.contains(r#""strategy":"throttle""#));
        assert_eq!(AdaptiveConfig::from_json(&json).unwrap(), config);
    }
}
