//! Size-aware segmented LRU
//!
//! A byte-budgeted cache with two segments:
//!
//! - **Probation**: entries seen once (just inserted)
//! - **Protected**: entries read again after insertion
//!
//! Eviction drains Probation before touching Protected, oldest access first
//! in both. A full scan that inserts many values once therefore only churns
//! Probation and leaves reused values alone.
//!
//! Entry sizes are supplied by the caller and never recomputed. Every entry
//! carries a TTL measured from its last `put`; expired entries read as misses
//! and are dropped on access.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Segment an entry currently lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Segment {
    Probation,
    Protected,
}

/// Cached value with its accounting data
struct CacheEntry<V> {
    value: V,
    size_bytes: u64,
    segment: Segment,
    created_at: Instant,
    last_access_at: Instant,
    ttl: Duration,
    /// Logical access time, key into the segment's order map
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Internal state guarded by the store's lock
struct SlruState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Probation keys ordered by last access tick
    probation: BTreeMap<u64, K>,
    /// Protected keys ordered by last access tick
    protected: BTreeMap<u64, K>,
    total_bytes: u64,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> SlruState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            probation: BTreeMap::new(),
            protected: BTreeMap::new(),
            total_bytes: 0,
            clock: 0,
        }
    }

    /// Advance the logical clock and return the new value
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn order_mut(&mut self, segment: Segment) -> &mut BTreeMap<u64, K> {
        match segment {
            Segment::Probation => &mut self.probation,
            Segment::Protected => &mut self.protected,
        }
    }

    fn charge(&mut self, size: u64) {
        self.total_bytes = self
            .total_bytes
            .checked_add(size)
            .unwrap_or_else(|| panic!("slru byte total overflow adding {size}"));
    }

    fn release(&mut self, size: u64) {
        assert!(
            size <= self.total_bytes,
            "slru byte total underflow: releasing {size} of {}",
            self.total_bytes
        );
        self.total_bytes -= size;
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order_mut(entry.segment).remove(&entry.tick);
        self.release(entry.size_bytes);
        Some(entry)
    }

    /// Oldest key to evict, skipping `pinned`
    fn eviction_candidate(&self, pinned: Option<&K>) -> Option<K> {
        [&self.probation, &self.protected]
            .into_iter()
            .flat_map(BTreeMap::values)
            .find(|k| pinned != Some(*k))
            .cloned()
    }

    /// Evict until the byte total fits `max_bytes`
    ///
    /// A pinned key is evicted only after everything else is gone; it is then
    /// left in place even when it alone exceeds the budget.
    fn evict_to(&mut self, max_bytes: u64, pinned: Option<&K>) -> u64 {
        let mut evicted = 0;
        while self.total_bytes > max_bytes {
            let Some(victim) = self.eviction_candidate(pinned) else {
                break;
            };
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }

    fn segment_len(&self, segment: Segment) -> usize {
        match segment {
            Segment::Probation => self.probation.len(),
            Segment::Protected => self.protected.len(),
        }
    }
}

/// Point-in-time statistics for a [`SizeAwareSlru`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlruStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub probation_entries: usize,
    pub protected_entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Byte-budgeted two-segment LRU cache with TTL
pub struct SizeAwareSlru<K, V> {
    state: Mutex<SlruState<K, V>>,
    max_bytes: u64,
    default_ttl: Duration,
    counters: Counters,
}

impl<K, V> SizeAwareSlru<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a store bounded to `max_bytes` whose entries live for `default_ttl`
    pub fn new(max_bytes: u64, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(SlruState::new()),
            max_bytes,
            default_ttl,
            counters: Counters::default(),
        }
    }

    /// Byte budget
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// TTL applied by [`put`](Self::put)
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or refresh a value with the default TTL
    pub fn put(&self, key: K, value: V, size_bytes: u64) {
        self.put_with_ttl(key, value, size_bytes, self.default_ttl);
    }

    /// Insert or refresh a value with an explicit TTL
    ///
    /// New keys enter Probation. A key already in Protected stays there; only
    /// its value, size and timestamps are refreshed.
    pub fn put_with_ttl(&self, key: K, value: V, size_bytes: u64, ttl: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let tick = state.tick();

        let segment = match state.remove(&key) {
            Some(old) => old.segment,
            None => Segment::Probation,
        };

        // Drop whatever the previous pass left over budget before charging,
        // so the running total always has room for `size_bytes`.
        let floor = if size_bytes > self.max_bytes {
            0
        } else {
            self.max_bytes.min(u64::MAX - size_bytes)
        };
        let mut evicted = state.evict_to(floor, None);

        state.order_mut(segment).insert(tick, key.clone());
        state.charge(size_bytes);
        state.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                size_bytes,
                segment,
                created_at: now,
                last_access_at: now,
                ttl,
                tick,
            },
        );

        let pinned = (size_bytes > self.max_bytes).then_some(&key);
        evicted += state.evict_to(self.max_bytes, pinned);
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(
                evicted,
                total_bytes = state.total_bytes,
                max_bytes = self.max_bytes,
                "slru eviction pass"
            );
        }
        debug_assert_eq!(
            state.entries.len(),
            state.probation.len() + state.protected.len()
        );
    }

    /// Look up a value
    ///
    /// Expired entries are dropped and reported as a miss. A hit on a
    /// Probation entry promotes it to Protected.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(entry) = state.entries.get(key) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired(now) {
            state.remove(key);
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let (segment, old_tick) = (entry.segment, entry.tick);

        let tick = state.tick();
        state.order_mut(segment).remove(&old_tick);
        state.protected.insert(tick, key.clone());

        let entry = state
            .entries
            .get_mut(key)
            .unwrap_or_else(|| unreachable!("entry vanished under lock"));
        entry.segment = Segment::Protected;
        entry.last_access_at = now;
        entry.tick = tick;

        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Check for a live entry without counting an access
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Segment of a live entry, without counting an access
    pub fn segment_of(&self, key: &K) -> Option<Segment> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.segment)
    }

    /// Time since the entry was last put or read
    pub fn idle_for(&self, key: &K) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| e.last_access_at.elapsed())
    }

    /// Remove an entry, returning its value
    pub fn delete(&self, key: &K) -> Option<V> {
        self.state.lock().remove(key).map(|e| e.value)
    }

    /// Remove every entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.probation.clear();
        state.protected.clear();
        state.total_bytes = 0;
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<K> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    /// Keys currently stored, oldest access first within each segment
    pub fn keys(&self) -> Vec<K> {
        let state = self.state.lock();
        state
            .probation
            .values()
            .chain(state.protected.values())
            .cloned()
            .collect()
    }

    /// Number of stored entries (expired ones included until dropped)
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Sum of the sizes of all stored entries
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Snapshot of counters and occupancy
    pub fn stats(&self) -> SlruStats {
        let state = self.state.lock();
        SlruStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: state.entries.len(),
            probation_entries: state.segment_len(Segment::Probation),
            protected_entries: state.segment_len(Segment::Protected),
            total_bytes: state.total_bytes,
            max_bytes: self.max_bytes,
        }
    }
}
