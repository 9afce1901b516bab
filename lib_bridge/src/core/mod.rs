//! # Core
//!
//! The bridge engine. Everything below `pipeline` is synchronous and clock-driven so it can be
//! tested with a [`ManualClock`]; `scheduler` and `bridge_manager` add the async runtime.
//!
//! - **`clock`**: injectable time source.
//! - **`state_cache`**: bounded device cache with history rings and eviction.
//! - **`differ`**: snapshot → `new`/`update`/`remove` change records.
//! - **`throttle`**, **`batcher`**: per-type rate limiting and batched, optionally compressed,
//!   outbound frames.
//! - **`hub`**: per-channel fan-out to dashboard clients.
//! - **`source_health`**: retry/backoff accounting for the poll source.
//! - **`scheduler`**: cancellable periodic timers.
//! - **`pipeline`**, **`bridge_manager`**: the glue and the actor that owns it.

pub mod batcher;
pub mod bridge_manager;
pub mod clock;
pub mod differ;
pub mod hub;
pub mod pipeline;
pub mod scheduler;
pub mod source_health;
pub mod state_cache;
pub mod throttle;

pub use batcher::{Batcher, BatcherStats, EnqueueOutcome};
pub use bridge_manager::{BridgeCommand, BridgeHandle, BridgeManager, BridgeStatus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use hub::{ClientId, FanoutHub, HubFrame, HubStats};
pub use pipeline::{BridgePipeline, PipelineOutput, PipelineStats};
pub use scheduler::{Scheduler, TimerEvent};
pub use source_health::{FailureAction, SourceHealth, SourceState};
pub use state_cache::{CacheStats, DeviceQuery, StateCache};
pub use throttle::Throttler;
