//! # TAK Output
//!
//! - **`cot`**: the pure device → Cursor-on-Target transform and its XML serialization.
//! - **`filter`**: exclusion lists and color overrides applied before encoding.
//! - **`broadcaster`**: the single outbound TCP/UDP link with its retry queue.
//! - **`worker`**: the task that owns the broadcaster, fed by a bounded queue.

pub mod broadcaster;
pub mod cot;
pub mod filter;
pub mod worker;

pub use broadcaster::{
    LinkState, NetConnector, TakBroadcaster, TakConnector, TakFingerprint, TakLink, TakStatus,
};
pub use cot::{
    AntennaSettings, CotEncoder, DisplayColor, MarkerColor, TacticalMessage, TacticalPoint,
};
pub use filter::{BroadcastFilter, FilterChange};
pub use worker::{TakReport, TakRequest, TakWorkerHandle};
