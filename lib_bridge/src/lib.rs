//! # lib_bridge
//!
//! The engine behind the Kismet → TAK telemetry bridge. It polls a Kismet server for device,
//! alert and system-status snapshots, keeps a bounded diffed cache of the devices it has seen,
//! throttles and batches the resulting events for dashboard subscribers, and turns qualifying
//! devices into Cursor-on-Target XML for a TAK unicast or multicast target.
//!
//! ## Module Map
//!
//! - **`configs`**: typed configuration with documented defaults (JSON5 on disk).
//! - **`models`**: device, alert, change and envelope records plus the raw-attribute parse
//!   boundary.
//! - **`core`**: clock, scheduler, cache, differ, throttler, batcher, fan-out hub, the pure
//!   pipeline and the single-task `BridgeManager` actor that owns all of it.
//! - **`ingestors`**: snapshot sources (`KismetPollingSource` over REST).
//! - **`retrieve`**: the retrying HTTP client used by the ingestors.
//! - **`tak`**: CoT encoding and the TAK broadcaster transport.
//! - **`loggers`**: `tracing` subscriber setup for binaries.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod errors;
pub mod ingestors;
pub mod models;
pub mod tak;

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "loggers")]
pub mod loggers;

// --- Public API Re-exports ---
pub use configs::BridgeConfig;
pub use errors::{BridgeError, Result};
pub use crate::core::{BridgeHandle, BridgeManager, BridgeStatus};
