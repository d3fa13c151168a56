//! Per-bag raw record cache
//!
//! Keeps every record of a series in memory when the series is small enough,
//! so repeated reads of the same series are served from memory. Admission is
//! size-gated:
//!
//! - series whose first record exceeds `raw_size_gate` are never cached
//! - a single series may use at most `max_per_series` bytes
//! - all series together may use at most `max_bytes`
//!
//! Callers check [`RecordCache::can_cache`] before a scan, re-check
//! [`RecordCache::budget_ok`] while collecting, and [`RecordCache::commit`]
//! the complete series at the end. Payloads stay encoded.

use bagcache_common::RecordCacheConfig;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// One raw record of a series
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    /// Receive time in nanoseconds
    pub timestamp_ns: i64,
    /// Encoded record payload
    pub payload: Bytes,
}

impl CachedRecord {
    pub fn new(timestamp_ns: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp_ns,
            payload: payload.into(),
        }
    }

    /// Payload size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.payload.len() as u64
    }
}

struct SeriesEntry {
    records: Arc<[CachedRecord]>,
    bytes: u64,
}

#[derive(Default)]
struct RecordState {
    series: HashMap<String, SeriesEntry>,
    total_bytes: u64,
}

/// Occupancy of one cached series
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesStats {
    pub records: usize,
    pub bytes: u64,
}

/// Occupancy of a [`RecordCache`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCacheStats {
    pub total_bytes: u64,
    pub series: BTreeMap<String, SeriesStats>,
}

/// Size-gated cache of complete series
pub struct RecordCache {
    config: RecordCacheConfig,
    state: Mutex<RecordState>,
}

impl RecordCache {
    pub fn new(config: RecordCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RecordState::default()),
        }
    }

    /// Limits this cache enforces
    pub const fn config(&self) -> &RecordCacheConfig {
        &self.config
    }

    /// Whether a series is worth collecting before scanning it
    ///
    /// `first_record_size` is the raw size of the series' first record and
    /// `record_count` the number of records the scan will yield.
    pub fn can_cache(&self, first_record_size: u64, record_count: u64) -> bool {
        if first_record_size > self.config.raw_size_gate {
            return false;
        }
        self.budget_ok(first_record_size.saturating_mul(record_count))
    }

    /// Whether `collected_bytes` still fits the per-series and total budgets
    pub fn budget_ok(&self, collected_bytes: u64) -> bool {
        if collected_bytes > self.config.max_per_series {
            return false;
        }
        let total = self.state.lock().total_bytes;
        total.saturating_add(collected_bytes) <= self.config.max_bytes
    }

    /// Store the complete record list of a series, replacing any earlier one
    ///
    /// Records must be ordered by timestamp.
    pub fn commit(&self, series_id: impl Into<String>, records: Vec<CachedRecord>, bytes_used: u64) {
        debug_assert!(
            records.is_sorted_by_key(|r| r.timestamp_ns),
            "records must be ordered by timestamp"
        );
        let series_id = series_id.into();
        let count = records.len();
        let mut state = self.state.lock();

        if let Some(old) = state.series.remove(&series_id) {
            state.total_bytes -= old.bytes;
        }
        state.total_bytes += bytes_used;
        state.series.insert(
            series_id.clone(),
            SeriesEntry {
                records: records.into(),
                bytes: bytes_used,
            },
        );

        debug!(
            series = %series_id,
            records = count,
            bytes = bytes_used,
            total_bytes = state.total_bytes,
            "cached series records"
        );
    }

    /// Check if a series is cached
    pub fn contains(&self, series_id: &str) -> bool {
        self.state.lock().series.contains_key(series_id)
    }

    /// All cached records of a series
    pub fn get(&self, series_id: &str) -> Option<Arc<[CachedRecord]>> {
        self.state
            .lock()
            .series
            .get(series_id)
            .map(|e| Arc::clone(&e.records))
    }

    /// Cached records of a series with `start <= timestamp <= end`
    ///
    /// Missing bounds are open. Returns `None` if the series is not cached.
    pub fn get_range(
        &self,
        series_id: &str,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Option<Vec<CachedRecord>> {
        let records = self.get(series_id)?;
        let lo = start.map_or(0, |s| records.partition_point(|r| r.timestamp_ns < s));
        let hi = end.map_or(records.len(), |e| {
            records.partition_point(|r| r.timestamp_ns <= e)
        });
        Some(records[lo..hi.max(lo)].to_vec())
    }

    /// Drop a single series
    pub fn remove(&self, series_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.series.remove(series_id) {
            Some(old) => {
                state.total_bytes -= old.bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every series
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.series.clear();
        state.total_bytes = 0;
    }

    /// Bytes used by all cached series
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Per-series occupancy
    pub fn stats(&self) -> RecordCacheStats {
        let state = self.state.lock();
        RecordCacheStats {
            total_bytes: state.total_bytes,
            series: state
                .series
                .iter()
                .map(|(id, e)| {
                    (
                        id.clone(),
                        SeriesStats {
                            records: e.records.len(),
                            bytes: e.bytes,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    fn records(count: usize, start_ns: i64, step_ns: i64) -> Vec<CachedRecord> {
        (0..count)
            .map(|i| CachedRecord::new(start_ns + i as i64 * step_ns, vec![0u8; 8]))
            .collect()
    }

    fn cache_with(max_bytes: u64, max_per_series: u64) -> RecordCache {
        RecordCache::new(RecordCacheConfig {
            max_bytes,
            max_per_series,
            ..RecordCacheConfig::default()
        })
    }

    #[test]
    fn test_commit_and_get() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/odom", records(10, 0, SEC / 10), 800);

        assert!(cache.contains("/odom"));
        assert_eq!(cache.get("/odom").unwrap().len(), 10);
        assert_eq!(cache.total_bytes(), 800);
    }

    #[test]
    fn test_get_missing_series() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        assert!(!cache.contains("/odom"));
        assert!(cache.get("/odom").is_none());
        assert!(cache.get_range("/odom", None, None).is_none());
    }

    #[test]
    fn test_get_range_unbounded_returns_all() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/odom", records(10, SEC, SEC / 10), 800);
        assert_eq!(cache.get_range("/odom", None, None).unwrap().len(), 10);
    }

    #[test]
    fn test_get_range_sliced() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/odom", records(100, 0, SEC / 10), 8000);

        let slice = cache.get_range("/odom", Some(2 * SEC), Some(5 * SEC)).unwrap();
        assert_eq!(slice.len(), 31);
        assert!(slice
            .iter()
            .all(|r| (2 * SEC..=5 * SEC).contains(&r.timestamp_ns)));

        let tail = cache.get_range("/odom", Some(9 * SEC), None).unwrap();
        assert_eq!(tail.len(), 10);
        assert!(cache.get_range("/odom", Some(5 * SEC), Some(2 * SEC)).unwrap().is_empty());
    }

    #[test]
    fn test_can_cache_accepts_small() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        assert!(cache.can_cache(500, 1000));
    }

    #[test]
    fn test_can_cache_rejects_large_record() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        assert!(!cache.can_cache(200_000, 100));
    }

    #[test]
    fn test_can_cache_rejects_over_per_series_budget() {
        let cache = cache_with(512 * 1024 * 1024, 1000);
        assert!(!cache.can_cache(100, 20));
    }

    #[test]
    fn test_can_cache_rejects_over_total_budget() {
        let cache = cache_with(5000, 5000);
        cache.commit("/a", records(5, 0, 1), 4500);
        assert!(!cache.can_cache(100, 10));
    }

    #[test]
    fn test_budget_ok_tracks_total() {
        let cache = cache_with(2000, 1500);
        cache.commit("/a", records(5, 0, 1), 1000);
        assert!(cache.budget_ok(500));
        assert!(!cache.budget_ok(1500));
    }

    #[test]
    fn test_budget_ok_per_series_limit() {
        let cache = cache_with(512 * 1024 * 1024, 1000);
        assert!(cache.budget_ok(999));
        assert!(!cache.budget_ok(1001));
    }

    #[test]
    fn test_recommit_replaces_accounting() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/imu", records(10, 0, 1), 400);
        cache.commit("/imu", records(20, 0, 1), 900);

        assert_eq!(cache.total_bytes(), 900);
        assert_eq!(cache.get("/imu").unwrap().len(), 20);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/odom", records(10, 0, 1), 800);
        cache.commit("/imu", records(10, 0, 1), 400);
        assert_eq!(cache.total_bytes(), 1200);

        assert!(cache.remove("/imu"));
        assert!(!cache.remove("/imu"));
        assert_eq!(cache.total_bytes(), 800);

        cache.clear();
        assert_eq!(cache.total_bytes(), 0);
        assert!(!cache.contains("/odom"));
    }

    #[test]
    fn test_stats() {
        let cache = RecordCache::new(RecordCacheConfig::default());
        cache.commit("/odom", records(5, 0, 1), 500);

        let stats = cache.stats();
        assert_eq!(stats.total_bytes, 500);
        assert_eq!(
            stats.series.get("/odom"),
            Some(&SeriesStats {
                records: 5,
                bytes: 500
            })
        );
    }
}
