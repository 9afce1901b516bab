//! # Change Records
//!
//! What the differ emits for each device on each poll.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::device::DeviceRecord;

/// Classification of a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    New,
    Update,
    Remove,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::New => "new",
            ChangeAction::Update => "update",
            ChangeAction::Remove => "remove",
        }
    }

    /// `new` and `remove` are never throttled and always flush immediately.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ChangeAction::Update)
    }
}

/// The device fields whose change produces an `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedField {
    Signal,
    Channel,
    Packets,
    Latitude,
    Longitude,
    LastSeen,
}

/// Changed tracked fields and their new values.
pub type DeviceChanges = BTreeMap<TrackedField, Value>;

/// # Change Record
///
/// `changes` is present only for [`ChangeAction::Update`] and is never empty there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub device: DeviceRecord,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub changes: Option<DeviceChanges>,
}

impl ChangeRecord {
    pub fn new_device(device: DeviceRecord) -> Self {
        Self { action: ChangeAction::New, device, changes: None }
    }

    pub fn updated(device: DeviceRecord, changes: DeviceChanges) -> Self {
        Self { action: ChangeAction::Update, device, changes: Some(changes) }
    }

    pub fn removed(device: DeviceRecord) -> Self {
        Self { action: ChangeAction::Remove, device, changes: None }
    }

    pub fn id(&self) -> &str {
        &self.device.id
    }
}
