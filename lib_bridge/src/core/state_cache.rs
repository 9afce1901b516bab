//! # Device State Cache
//!
//! A bounded map of the devices seen by recent polls, each with a FIFO history ring. The cache
//! is owned by exactly one task (the bridge actor), so it uses plain `&mut self` methods and no
//! locking.
//!
//! ## Bounds
//!
//! - **Capacity**: inserting a new id while full evicts exactly one entry, the least recently
//!   observed one, before the insert.
//! - **TTL**: [`StateCache::sweep`] deletes entries not observed for longer than the TTL.
//! - **Occupancy guard**: a sweep that finds occupancy above the high-water ratio evicts the
//!   oldest entries until occupancy is at the target ratio.
//! - **History**: each ring holds at most `max_history_per_device` samples; the oldest sample is
//!   dropped first.
//!
//! Recency is the clock time of the last poll that contained the device, with a monotonically
//! increasing touch sequence breaking ties inside one poll.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use super::clock::SharedClock;
use crate::configs::CacheConfig;
use crate::models::{DeviceRecord, DeviceType, HistorySample};

/// One cached device.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: DeviceRecord,
    history: VecDeque<HistorySample>,
    observed_at_ms: i64,
    touch_seq: u64,
}

impl CacheEntry {
    pub fn history(&self) -> impl Iterator<Item = &HistorySample> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn observed_at_ms(&self) -> i64 {
        self.observed_at_ms
    }

    fn order_key(&self) -> (i64, u64) {
        (self.observed_at_ms, self.touch_seq)
    }
}

/// Filters for [`StateCache::active_devices`].
#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    /// Only devices observed within this many milliseconds. Defaults to five minutes.
    pub max_age_ms: Option<i64>,
    pub min_signal: Option<i32>,
    pub device_type: Option<DeviceType>,
    /// Case-insensitive substring of the SSID.
    pub ssid_contains: Option<String>,
}

/// Entries removed by one sweep, split by cause.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub expired: Vec<DeviceRecord>,
    pub trimmed: Vec<DeviceRecord>,
}

impl SweepReport {
    pub fn removed(self) -> impl Iterator<Item = DeviceRecord> {
        self.expired.into_iter().chain(self.trimmed)
    }

    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.trimmed.is_empty()
    }
}

/// Counters exposed through the bridge status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_devices: usize,
    pub capacity: usize,
    pub history_entries: usize,
    pub devices_removed: u64,
    pub cleanup_runs: u64,
    pub memory_warnings: u64,
}

/// # State Cache
pub struct StateCache {
    config: CacheConfig,
    clock: SharedClock,
    entries: HashMap<String, CacheEntry>,
    /// Recency index: `(observed_at_ms, touch_seq)` to id, oldest first.
    order: BTreeMap<(i64, u64), String>,
    next_seq: u64,
    devices_removed: u64,
    cleanup_runs: u64,
    memory_warnings: u64,
}

impl StateCache {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            devices_removed: 0,
            cleanup_runs: 0,
            memory_warnings: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_devices
    }

    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Ids currently cached, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    fn bump(&mut self) -> (i64, u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (self.clock.now_ms(), seq)
    }

    /// # Upsert
    ///
    /// Stores `record` as the latest state of its device, appends a history sample and marks it
    /// most recently observed. When the id is new and the cache is full, the least recently
    /// observed entry is evicted first and returned.
    pub fn upsert(&mut self, record: DeviceRecord) -> Option<DeviceRecord> {
        let (now, seq) = self.bump();
        let sample = HistorySample { timestamp_ms: now, ..record.sample() };
        let cap = self.config.max_history_per_device;

        if let Some(entry) = self.entries.get_mut(&record.id) {
            self.order.remove(&entry.order_key());
            entry.record = record;
            entry.observed_at_ms = now;
            entry.touch_seq = seq;
            push_bounded(&mut entry.history, sample, cap);
            self.order.insert(entry.order_key(), entry.record.id.clone());
            return None;
        }

        let evicted = if self.entries.len() >= self.config.max_devices {
            self.evict_oldest()
        } else {
            None
        };
        if let Some(old) = &evicted {
            debug!(
                evicted = %old.id,
                incoming = %record.id,
                "Cache at capacity, evicted least recently seen device"
            );
        }

        let mut history = VecDeque::with_capacity(cap.min(16));
        push_bounded(&mut history, sample, cap);
        let entry = CacheEntry { record, history, observed_at_ms: now, touch_seq: seq };
        self.order.insert(entry.order_key(), entry.record.id.clone());
        self.entries.insert(entry.record.id.clone(), entry);
        evicted
    }

    /// Marks a device as observed without changing its record or history.
    pub fn touch(&mut self, id: &str) {
        let (now, seq) = self.bump();
        if let Some(entry) = self.entries.get_mut(id) {
            self.order.remove(&entry.order_key());
            entry.observed_at_ms = now;
            entry.touch_seq = seq;
            self.order.insert(entry.order_key(), id.to_string());
        }
    }

    /// Deletes a device and its history.
    pub fn remove(&mut self, id: &str) -> Option<DeviceRecord> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.order_key());
        self.devices_removed += 1;
        Some(entry.record)
    }

    fn evict_oldest(&mut self) -> Option<DeviceRecord> {
        let (_, id) = self.order.pop_first()?;
        let entry = self.entries.remove(&id)?;
        self.devices_removed += 1;
        Some(entry.record)
    }

    /// # Sweep
    ///
    /// Runs on the eviction timer:
    /// 1. deletes entries older than the TTL,
    /// 2. prunes history samples older than the TTL from the survivors,
    /// 3. applies the occupancy guard.
    pub fn sweep(&mut self) -> SweepReport {
        let now = self.clock.now_ms();
        let ttl = self.config.ttl_ms as i64;
        let mut report = SweepReport::default();

        while let Some((&(observed_at, _), _)) = self.order.first_key_value() {
            if now - observed_at <= ttl {
                break;
            }
            match self.evict_oldest() {
                Some(record) => report.expired.push(record),
                None => break,
            }
        }

        for entry in self.entries.values_mut() {
            entry.history.retain(|s| now - s.timestamp_ms <= ttl);
        }

        let occupancy = self.occupancy();
        if occupancy > self.config.high_water_ratio {
            let target =
                (self.config.max_devices as f64 * self.config.target_ratio).floor() as usize;
            while self.entries.len() > target {
                match self.evict_oldest() {
                    Some(record) => report.trimmed.push(record),
                    None => break,
                }
            }
            warn!(
                occupancy,
                trimmed = report.trimmed.len(),
                remaining = self.entries.len(),
                "Cache above high-water mark, trimmed oldest devices"
            );
        } else if occupancy > self.config.warning_ratio {
            self.memory_warnings += 1;
            warn!(occupancy, "Cache occupancy above warning ratio");
        }

        self.cleanup_runs += 1;
        if !report.is_empty() {
            debug!(
                expired = report.expired.len(),
                trimmed = report.trimmed.len(),
                "Cache sweep finished"
            );
        }
        report
    }

    fn occupancy(&self) -> f64 {
        self.entries.len() as f64 / self.config.max_devices as f64
    }

    /// The last `limit` history samples of a device, oldest first.
    pub fn history(&self, id: &str, limit: usize) -> Vec<HistorySample> {
        self.entries
            .get(id)
            .map(|entry| {
                let skip = entry.history.len().saturating_sub(limit);
                entry.history.iter().skip(skip).copied().collect()
            })
            .unwrap_or_default()
    }

    /// Devices observed recently that match every given filter, strongest signal first.
    pub fn active_devices(&self, query: &DeviceQuery) -> Vec<DeviceRecord> {
        let now = self.clock.now_ms();
        let max_age = query.max_age_ms.unwrap_or(300_000);
        let needle = query.ssid_contains.as_ref().map(|s| s.to_lowercase());

        let mut devices: Vec<DeviceRecord> = self
            .entries
            .values()
            .filter(|e| now - e.observed_at_ms <= max_age)
            .map(|e| &e.record)
            .filter(|d| query.min_signal.map_or(true, |min| d.signal >= min))
            .filter(|d| query.device_type.map_or(true, |t| d.device_type == t))
            .filter(|d| match &needle {
                Some(n) => d.ssid.as_ref().is_some_and(|s| s.to_lowercase().contains(n)),
                None => true,
            })
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            total_devices: self.entries.len(),
            capacity: self.config.max_devices,
            history_entries: self.entries.values().map(|e| e.history.len()).sum(),
            devices_removed: self.devices_removed,
            cleanup_runs: self.cleanup_runs,
            memory_warnings: self.memory_warnings,
        }
    }
}

fn push_bounded(ring: &mut VecDeque<HistorySample>, sample: HistorySample, cap: usize) {
    if cap == 0 {
        ring.clear();
        return;
    }
    while ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(sample);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use std::sync::Arc;

    fn config(max_devices: usize) -> CacheConfig {
        CacheConfig {
            max_devices,
            max_history_per_device: 3,
            ttl_ms: 10_000,
            ..CacheConfig::default()
        }
    }

    fn device(id: &str, signal: i32) -> DeviceRecord {
        let mut d = DeviceRecord::new(id);
        d.signal = signal;
        d
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let clock = ManualClock::new(0);
        let mut cache = StateCache::new(config(3), clock.clone());
        cache.upsert(device("a", -50));
        clock.advance(10);
        cache.upsert(device("b", -50));
        clock.advance(10);
        cache.upsert(device("c", -50));
        clock.advance(10);
        cache.touch("a");

        let evicted = cache.upsert(device("d", -50)).unwrap();
        assert_eq!(evicted.id, "b");
        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a") && cache.contains("c") && cache.contains("d"));

        // Updating an existing id never evicts.
        assert!(cache.upsert(device("c", -40)).is_none());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let clock = ManualClock::new(0);
        let mut cache = StateCache::new(config(10), clock.clone());
        for signal in [-90, -80, -70, -60, -50] {
            clock.advance(1);
            cache.upsert(device("a", signal));
        }
        let history = cache.history("a", 50);
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().map(|s| s.signal).collect::<Vec<_>>(), vec![-70, -60, -50]);
        assert_eq!(cache.history("a", 1)[0].signal, -50);
        assert!(cache.history("missing", 5).is_empty());
    }

    #[test]
    fn test_sweep_expires_by_ttl() {
        let clock = ManualClock::new(0);
        let mut cache = StateCache::new(config(10), clock.clone());
        cache.upsert(device("old", -50));
        clock.advance(8_000);
        cache.upsert(device("fresh", -50));
        clock.advance(3_000);

        let report = cache.sweep();
        assert_eq!(report.expired.len(), 1);
        assert_eq!(report.expired[0].id, "old");
        assert!(report.trimmed.is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().cleanup_runs, 1);
    }

    #[test]
    fn test_sweep_occupancy_guard_trims_to_target() {
        let clock: Arc<ManualClock> = ManualClock::new(0);
        let mut cache = StateCache::new(config(100), clock.clone());
        for i in 0..100 {
            clock.advance(1);
            cache.upsert(device(&format!("dev-{:03}", i), -60));
        }

        let report = cache.sweep();
        assert_eq!(report.trimmed.len(), 30);
        assert_eq!(cache.len(), 70);
        assert_eq!(report.trimmed[0].id, "dev-000");
        assert!(cache.contains("dev-099"));
    }

    #[test]
    fn test_sweep_counts_warning_between_ratios() {
        let clock = ManualClock::new(0);
        let mut cache = StateCache::new(config(10), clock.clone());
        for i in 0..9 {
            cache.upsert(device(&i.to_string(), -60));
        }
        let report = cache.sweep();
        assert!(report.is_empty());
        assert_eq!(cache.stats().memory_warnings, 1);
    }

    #[test]
    fn test_active_devices_filters() {
        let clock = ManualClock::new(0);
        let mut cache = StateCache::new(config(10), clock.clone());
        let mut ap = device("ap", -40);
        ap.device_type = DeviceType::AccessPoint;
        ap.ssid = Some("CoffeeShop".into());
        cache.upsert(ap);
        cache.upsert(device("weak", -95));
        clock.advance(400_000);
        cache.upsert(device("recent", -70));

        let all_recent = cache.active_devices(&DeviceQuery::default());
        assert_eq!(all_recent.len(), 1);

        let wide = DeviceQuery { max_age_ms: Some(1_000_000), ..Default::default() };
        assert_eq!(cache.active_devices(&wide)[0].id, "ap");

        let strong_aps = DeviceQuery {
            max_age_ms: Some(1_000_000),
            min_signal: Some(-80),
            device_type: Some(DeviceType::AccessPoint),
            ssid_contains: Some("coffee".into()),
        };
        let found = cache.active_devices(&strong_aps);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "ap");
    }

    #[test]
    fn test_zero_history_cap_keeps_no_samples() {
        let config = CacheConfig { max_history_per_device: 0, ..config(4) };
        let mut cache = StateCache::new(config, ManualClock::new(0));
        cache.upsert(device("a", -50));
        cache.upsert(device("a", -40));
        assert_eq!(cache.len(), 1);
        assert!(cache.history("a", 10).is_empty());
    }
}
