//! # Models
//!
//! Typed records that flow through the bridge. Raw Kismet JSON enters through [`raw`] and
//! leaves as [`DeviceRecord`], [`AlertRecord`] and [`SystemStatus`]; the differ turns device
//! records into [`ChangeRecord`]s, and everything delivered to dashboards is wrapped in an
//! [`Envelope`].

pub mod alert;
pub mod change;
pub mod device;
pub mod envelope;
pub mod raw;

pub use alert::{AlertRecord, ScanStatus, SeverityLevel, SystemStatus};
pub use change::{ChangeAction, ChangeRecord, DeviceChanges, TrackedField};
pub use device::{DeviceRecord, DeviceType, GeoLocation, HistorySample, PacketCounters};
pub use envelope::{Channel, Envelope, EventKind};
