//! Error types for the reactive core.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants
//! fall into four groups:
//!
//! - computation failures, recovered locally by computed nodes
//! - configuration failures, raised at construction time
//! - optimizer failures, recovered by adaptive cells
//! - use after disposal

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by cells, computed nodes, optimizers and their configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// An operation was attempted on a disposed cell, node or optimizer.
    #[error("{kind} {id} has been disposed")]
    Disposed { kind: &'static str, id: u64 },

    /// A computed node's function failed.
    #[error("computation of node {node} failed: {message}")]
    Computation { node: u64, message: String },

    /// A computed node read itself while evaluating.
    #[error("node {0} read its own value while evaluating")]
    Cycle(u64),

    /// A tracking frame was ended out of order.
    #[error("tracking frame mismatch: expected {expected}, found {found:?}")]
    FrameMismatch { expected: u64, found: Option<u64> },

    /// A context signal was registered without a name.
    #[error("context signal name must not be empty")]
    EmptySignalName,

    /// Two context signals in the same set share a name.
    #[error("duplicate context signal `{0}`")]
    DuplicateSignal(String),

    /// A context signal reported a value outside [0, 1].
    #[error("context signal `{name}` reported {value}, expected a value in [0, 1]")]
    SignalOutOfRange { name: String, value: f64 },

    /// A context signal provider failed to initialize.
    #[error("context signal `{name}` failed to initialize: {message}")]
    SignalInit { name: String, message: String },

    /// A duration parameter was zero.
    #[error("{0} must be a positive duration")]
    InvalidDuration(&'static str),

    /// A capacity parameter was zero.
    #[error("{0} must be at least 1")]
    InvalidCapacity(&'static str),

    /// Any other out-of-range optimizer parameter.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An optimizer was handed a history older than one it already consumed.
    #[error("history rewound: newest sequence {newest} precedes consumed sequence {consumed}")]
    HistoryRewound { newest: u64, consumed: u64 },
}

impl Error {
    pub(crate) fn disposed(kind: &'static str, id: u64) -> Self {
        Self::Disposed { kind, id }
    }

    /// Whether this error is a configuration-time validation failure.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptySignalName
                | Self::DuplicateSignal(_)
                | Self::SignalOutOfRange { .. }
                | Self::SignalInit { .. }
                | Self::InvalidDuration(_)
                | Self::InvalidCapacity(_)
                | Self::InvalidParameter { .. }
                | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
