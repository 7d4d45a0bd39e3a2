//! Ripple Core
//!
//! This crate provides a reactive value-propagation runtime. It implements:
//!
//! - Observable cells with subscriber notification
//! - Computed nodes whose dependencies are discovered by execution
//! - Adaptive cells that filter writes through update optimizers
//!   (debounce, throttle, pattern-based prediction)
//! - Context signals that let optimizers react to the environment
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: cells, computed nodes and dependency tracking
//! - `adaptive`: transition history, context signals, optimizers and adaptive cells
//! - `timer`: clocks and schedulers used by time-based optimizers
//! - `config`: serde-loadable optimizer configuration
//!
//! # Example
//!
//! ```rust
//! use ripple_core::reactive::{Cell, Computed, TrackingContext};
//!
//! let ctx = TrackingContext::new();
//!
//! // Create a cell
//! let count = Cell::new(&ctx, 1);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = Computed::new(&ctx, move || c.read().unwrap_or_default() * 2);
//!
//! // Update the cell
//! count.write(5).unwrap();
//! assert_eq!(doubled.value().unwrap(), 10);
//! ```

pub mod adaptive;
pub mod config;
pub mod reactive;
pub mod timer;

mod error;

pub use error::{Error, Result};
