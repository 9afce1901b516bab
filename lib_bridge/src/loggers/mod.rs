//! # Loggers
//!
//! `tracing` subscriber setup for the bridge binaries. Library code only emits events through
//! the `tracing` macros; installing a subscriber is left to the process entry point.

/// Console plus rolling JSON file subscriber.
pub mod tracing_setup;

pub use tracing_setup::{setup_logging, LogOptions};
