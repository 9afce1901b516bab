//! # Snapshot Differ
//!
//! Classifies every device of a poll snapshot against the cache and applies the result, so
//! `new`, `update` and `remove` for one cycle are all derived from the same snapshot.

use std::collections::HashSet;

use serde_json::{json, Value};

use super::state_cache::StateCache;
use crate::models::{ChangeRecord, DeviceChanges, DeviceRecord, TrackedField};

/// Tracked fields that differ between two states of one device, with their new values.
///
/// Returns `None` when nothing tracked changed. Otherwise the map always carries `lastSeen`
/// alongside the fields that actually changed.
pub fn diff_device(previous: &DeviceRecord, current: &DeviceRecord) -> Option<DeviceChanges> {
    let mut changes = DeviceChanges::new();

    if previous.signal != current.signal {
        changes.insert(TrackedField::Signal, json!(current.signal));
    }
    if previous.channel != current.channel {
        changes.insert(TrackedField::Channel, json!(current.channel));
    }
    if previous.packets.total != current.packets.total {
        changes.insert(TrackedField::Packets, json!(current.packets.total));
    }
    if previous.latitude() != current.latitude() {
        changes.insert(TrackedField::Latitude, optional(current.latitude()));
    }
    if previous.longitude() != current.longitude() {
        changes.insert(TrackedField::Longitude, optional(current.longitude()));
    }

    if changes.is_empty() && previous.last_seen_ms == current.last_seen_ms {
        return None;
    }
    changes.insert(TrackedField::LastSeen, json!(current.last_seen_ms));
    Some(changes)
}

fn optional(value: Option<f64>) -> Value {
    value.map_or(Value::Null, |v| json!(v))
}

/// # Apply Snapshot
///
/// Reconciles the cache with one full device snapshot and returns the resulting change
/// records in snapshot order, followed by removals:
///
/// - ids not yet cached are inserted and reported `new`; a capacity eviction caused by the
///   insert is reported as a `remove` of the evicted device,
/// - cached ids whose tracked fields differ are replaced and reported `update`,
/// - cached ids that are unchanged are only marked as observed,
/// - cached ids missing from the snapshot are deleted and reported `remove`.
///
/// Duplicate ids inside one snapshot are treated as successive observations.
pub fn apply_snapshot(cache: &mut StateCache, snapshot: Vec<DeviceRecord>) -> Vec<ChangeRecord> {
    let mut changes = Vec::with_capacity(snapshot.len());
    let seen: HashSet<String> = snapshot.iter().map(|d| d.id.clone()).collect();

    for device in snapshot {
        let previous = cache.get(&device.id).map(|entry| entry.record.clone());
        match previous {
            None => {
                if let Some(evicted) = cache.upsert(device.clone()) {
                    changes.push(ChangeRecord::removed(evicted));
                }
                changes.push(ChangeRecord::new_device(device));
            }
            Some(previous) => match diff_device(&previous, &device) {
                Some(diff) => {
                    cache.upsert(device.clone());
                    changes.push(ChangeRecord::updated(device, diff));
                }
                None => cache.touch(&device.id),
            },
        }
    }

    let missing: Vec<String> = cache.ids().filter(|id| !seen.contains(*id)).cloned().collect();
    for id in missing {
        if let Some(record) = cache.remove(&id) {
            changes.push(ChangeRecord::removed(record));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CacheConfig;
    use crate::core::clock::ManualClock;
    use crate::models::{ChangeAction, GeoLocation};

    fn device(id: &str, signal: i32, last_seen_ms: i64) -> DeviceRecord {
        let mut d = DeviceRecord::new(id);
        d.signal = signal;
        d.last_seen_ms = last_seen_ms;
        d
    }

    fn cache(max_devices: usize) -> StateCache {
        StateCache::new(CacheConfig { max_devices, ..CacheConfig::default() }, ManualClock::new(0))
    }

    #[test]
    fn test_signal_only_diff() {
        let before = device("a", -70, 1_000);
        let after = device("a", -45, 3_000);
        let diff = diff_device(&before, &after).unwrap();
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[&TrackedField::Signal], json!(-45));
        assert_eq!(diff[&TrackedField::LastSeen], json!(3_000));
    }

    #[test]
    fn test_identical_records_have_no_diff() {
        let d = device("a", -70, 1_000);
        assert!(diff_device(&d, &d.clone()).is_none());
    }

    #[test]
    fn test_untracked_field_is_ignored() {
        let before = device("a", -70, 1_000);
        let mut after = before.clone();
        after.manufacturer = Some("Acme".into());
        after.packets.retry = 9;
        assert!(diff_device(&before, &after).is_none());
    }

    #[test]
    fn test_location_gain_reports_coordinates() {
        let before = device("a", -70, 1_000);
        let mut after = before.clone();
        after.location = Some(GeoLocation { lat: 1.5, lon: 2.5, alt: None, accuracy: None });
        let diff = diff_device(&before, &after).unwrap();
        assert_eq!(diff[&TrackedField::Latitude], json!(1.5));
        assert_eq!(diff[&TrackedField::Longitude], json!(2.5));
        assert!(diff.contains_key(&TrackedField::LastSeen));
    }

    #[test]
    fn test_new_update_remove_cycle() {
        let mut cache = cache(10);

        let changes = apply_snapshot(&mut cache, vec![device("AA:BB:CC:DD:EE:FF", -70, 1_000)]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::New);
        assert_eq!(cache.len(), 1);

        let changes = apply_snapshot(&mut cache, vec![device("AA:BB:CC:DD:EE:FF", -45, 2_000)]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Update);
        let diff = changes[0].changes.as_ref().unwrap();
        assert_eq!(
            diff.keys().copied().collect::<Vec<_>>(),
            vec![TrackedField::Signal, TrackedField::LastSeen]
        );

        let unchanged = apply_snapshot(&mut cache, vec![device("AA:BB:CC:DD:EE:FF", -45, 2_000)]);
        assert!(unchanged.is_empty());

        let changes = apply_snapshot(&mut cache, Vec::new());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].action, ChangeAction::Remove);
        assert_eq!(changes[0].device.signal, -45);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_eviction_is_reported() {
        let mut cache = cache(2);
        apply_snapshot(&mut cache, vec![device("a", -50, 1), device("b", -50, 1)]);

        let next = vec![device("a", -50, 1), device("b", -50, 1), device("c", -50, 1)];
        let changes = apply_snapshot(&mut cache, next);
        let removed: Vec<_> = changes.iter().filter(|c| c.action == ChangeAction::Remove).collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("c"));
    }
}
