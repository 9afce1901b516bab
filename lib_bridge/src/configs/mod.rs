//! # Configuration Module
//!
//! Typed configuration for every bridge component. The structs deserialize from JSON5 with
//! camelCase keys and fall back to documented defaults for anything omitted, so a config file
//! only has to name what it changes.

/// The bridge configuration tree and its loaders.
pub mod config_bridge;

pub use config_bridge::{
    AntennaConfig, BatchConfig, BridgeConfig, CacheConfig, CotConfig, SignalThresholds,
    SourceConfig, TakConfig, TakFilter, TakProtocol, TakServerConfig, ThrottleConfig,
    TrailingEdge,
};
