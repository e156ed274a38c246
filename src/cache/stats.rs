//! Per-region counters.
//!
//! Every counter is mirrored to the `metrics` facade with a `region` label so
//! an installed recorder sees the same numbers the introspection surface
//! reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

pub(crate) const METRIC_REGION_HIT: &str = "vaultcache_region_hit_total";
pub(crate) const METRIC_REGION_MISS: &str = "vaultcache_region_miss_total";
pub(crate) const METRIC_REGION_PUT: &str = "vaultcache_region_put_total";
pub(crate) const METRIC_REGION_REMOVE: &str = "vaultcache_region_remove_total";
pub(crate) const METRIC_REGION_LOCK_CONFLICT: &str = "vaultcache_region_lock_conflict_total";
pub(crate) const METRIC_REGION_STALE_WRITE: &str = "vaultcache_region_stale_write_total";
pub(crate) const METRIC_REGION_ENTRIES: &str = "vaultcache_region_entries";
pub(crate) const METRIC_TIMESTAMP_TOUCH: &str = "vaultcache_timestamp_touch_total";

#[derive(Debug)]
pub struct RegionStats {
    region: Arc<str>,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    removals: AtomicU64,
    lock_conflicts: AtomicU64,
    stale_writes: AtomicU64,
}

impl RegionStats {
    pub fn new(region: Arc<str>) -> Self {
        Self {
            region,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removals: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
            stale_writes: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) {
        self.bump(&self.hits, METRIC_REGION_HIT);
    }

    pub fn record_miss(&self) {
        self.bump(&self.misses, METRIC_REGION_MISS);
    }

    pub fn record_put(&self) {
        self.bump(&self.puts, METRIC_REGION_PUT);
    }

    pub fn record_removal(&self) {
        self.bump(&self.removals, METRIC_REGION_REMOVE);
    }

    pub fn record_removals(&self, count: usize) {
        if count > 0 {
            self.bump_by(&self.removals, METRIC_REGION_REMOVE, count as u64);
        }
    }

    pub fn record_lock_conflict(&self) {
        self.bump(&self.lock_conflicts, METRIC_REGION_LOCK_CONFLICT);
    }

    pub fn record_stale_write(&self) {
        self.bump(&self.stale_writes, METRIC_REGION_STALE_WRITE);
    }

    fn bump(&self, slot: &AtomicU64, metric: &'static str) {
        self.bump_by(slot, metric, 1);
    }

    fn bump_by(&self, slot: &AtomicU64, metric: &'static str, count: u64) {
        slot.fetch_add(count, Ordering::Relaxed);
        counter!(metric, "region" => self.region.to_string()).increment(count);
    }

    pub fn snapshot(&self, entries: usize) -> RegionStatistics {
        RegionStatistics {
            region: self.region.to_string(),
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a region's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegionStatistics {
    pub region: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removals: u64,
    pub lock_conflicts: u64,
    pub stale_writes: u64,
}

impl RegionStatistics {
    /// Calculate the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
