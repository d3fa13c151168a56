//! Bag handle pool
//!
//! The [`Manager`] keeps at most `max_open` [`Handle`]s alive, keyed by
//! [`BagKey`]. It is the only component that creates or retires handles.
//!
//! # Lookup path
//! 1. Resolve a fresh key for the requested path
//! 2. Retire handles idle longer than `idle_ttl`
//! 3. Hit: return the pooled handle and refresh its LRU position
//! 4. Same bag under an older key: retire the stale handle. A pooled key
//!    with a newer mtime than ours wins instead, since ours was resolved
//!    before the bag changed
//! 5. Miss: open a new handle with the pool lock released, then re-lock,
//!    evict the least recently used handle if the pool is full, and commit
//!
//! Retired handles are closed after the pool lock is dropped. Close failures
//! are logged and never stop an eviction.

use crate::handle::{Handle, HandleSummary};
use crate::key::{BagKey, expand_home};
use crate::resource::{BagOpener, FileOpener};
use bagcache_common::{CacheConfig, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why a handle left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retirement {
    /// Pool was full
    Lru,
    /// Unused for longer than the idle TTL
    Idle,
    /// Bag changed on disk
    Stale,
    /// Caller asked for it
    Invalidated,
    /// Lost a race with another open of the same key
    Duplicate,
}

impl Retirement {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Idle => "idle",
            Self::Stale => "stale",
            Self::Invalidated => "invalidated",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Outcome of probing the pool for a freshly resolved key
enum Lookup<O: BagOpener> {
    Hit(Arc<Handle<O>>),
    Miss {
        /// Handle for the same bag under an outdated key
        stale: Vec<Arc<Handle<O>>>,
    },
}

struct PoolEntry<O: BagOpener> {
    handle: Arc<Handle<O>>,
    /// Logical time of the last lookup, for LRU ordering
    last_used: u64,
}

struct Pool<O: BagOpener> {
    entries: HashMap<BagKey, PoolEntry<O>>,
    clock: u64,
}

impl<O: BagOpener> Pool<O> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lookup(&mut self, key: &BagKey) -> Lookup<O> {
        let tick = self.tick();
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_used = tick;
            return Lookup::Hit(Arc::clone(&entry.handle));
        }
        Lookup::Miss {
            stale: self.remove_where(|k| k.same_bag(key)),
        }
    }

    /// Pooled handle for the same bag under a strictly newer mtime
    fn newer_than(&mut self, key: &BagKey) -> Option<Arc<Handle<O>>> {
        let tick = self.tick();
        let entry = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.same_bag(key) && k.mtime_ns > key.mtime_ns)
            .map(|(_, e)| e)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.handle))
    }

    fn insert(&mut self, key: BagKey, handle: Arc<Handle<O>>) {
        let last_used = self.tick();
        self.entries.insert(key, PoolEntry { handle, last_used });
    }

    fn remove_where(&mut self, pred: impl Fn(&BagKey) -> bool) -> Vec<Arc<Handle<O>>> {
        let keys: Vec<BagKey> = self.entries.keys().filter(|&k| pred(k)).cloned().collect();
        keys.iter()
            .filter_map(|k| self.entries.remove(k))
            .map(|e| e.handle)
            .collect()
    }

    fn remove_idle(&mut self, idle_ttl: Duration) -> Vec<Arc<Handle<O>>> {
        let idle: Vec<BagKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.handle.idle_for() > idle_ttl)
            .map(|(k, _)| k.clone())
            .collect();
        idle.iter()
            .filter_map(|k| self.entries.remove(k))
            .map(|e| e.handle)
            .collect()
    }

    fn pop_lru(&mut self) -> Option<Arc<Handle<O>>> {
        let lru = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&lru).map(|e| e.handle)
    }

    /// Handles ordered from least to most recently used
    fn by_recency(&self) -> Vec<Arc<Handle<O>>> {
        let mut entries: Vec<&PoolEntry<O>> = self.entries.values().collect();
        entries.sort_by_key(|e| e.last_used);
        entries.into_iter().map(|e| Arc::clone(&e.handle)).collect()
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub open_count: usize,
    pub max_open: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub invalidation_count: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Bounded pool of bag handles
pub struct Manager<O: BagOpener = FileOpener> {
    pool: Mutex<Pool<O>>,
    opener: Arc<O>,
    config: CacheConfig,
    counters: Counters,
}

impl Manager<FileOpener> {
    /// Create a pool that opens bag data files read-only
    pub fn with_file_opener(config: CacheConfig) -> Result<Self> {
        Self::new(config, FileOpener)
    }
}

impl<O: BagOpener> Manager<O> {
    /// Create an empty pool
    ///
    /// Fails if the configuration does not validate.
    pub fn new(config: CacheConfig, opener: O) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            pool: Mutex::new(Pool::new()),
            opener: Arc::new(opener),
            config,
            counters: Counters::default(),
        })
    }

    /// Configuration the pool was created with
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Get the handle for the bag at `path`, opening it if needed
    ///
    /// Fails with `NotFound` or `AmbiguousBag` if the path does not resolve
    /// to a bag and with `OpenFailed` if the bag cannot be opened. Nothing is
    /// added to the pool on failure.
    pub fn get_handle(&self, path: impl AsRef<Path>) -> Result<Arc<Handle<O>>> {
        let requested = expand_home(path.as_ref());
        let key = BagKey::resolve(&requested)?;

        let mut retired = Vec::new();
        {
            let mut pool = self.pool.lock();
            retired.extend(
                pool.remove_idle(self.config.idle_ttl())
                    .into_iter()
                    .map(|h| (h, Retirement::Idle)),
            );
            match pool
                .newer_than(&key)
                .map_or_else(|| pool.lookup(&key), Lookup::Hit)
            {
                Lookup::Hit(handle) => {
                    drop(pool);
                    self.retire_all(retired);
                    handle.touch();
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(handle);
                }
                Lookup::Miss { stale } => {
                    for handle in stale {
                        info!(path = %requested.display(), "bag changed on disk, invalidating cached handle");
                        retired.push((handle, Retirement::Stale));
                    }
                }
            }
        }
        self.retire_all(retired);

        // Open without holding the pool lock.
        let handle = Arc::new(Handle::new(
            key.clone(),
            requested.clone(),
            Arc::clone(&self.opener),
            &self.config,
        ));
        handle.open()?;

        Ok(self.commit(key, &requested, handle))
    }

    /// Insert a freshly opened handle, or adopt the one another caller
    /// committed while it was opening
    fn commit(&self, key: BagKey, requested: &Path, handle: Arc<Handle<O>>) -> Arc<Handle<O>> {
        let mut retired = Vec::new();
        let mut pool = self.pool.lock();
        let existing = match pool
            .newer_than(&key)
            .map_or_else(|| pool.lookup(&key), Lookup::Hit)
        {
            Lookup::Hit(existing) => Some(existing),
            Lookup::Miss { stale } => {
                retired.extend(stale.into_iter().map(|h| (h, Retirement::Stale)));
                None
            }
        };

        if let Some(existing) = existing {
            // Another caller committed this bag, as seen now or later than
            // our key, while we were opening.
            drop(pool);
            retired.push((handle, Retirement::Duplicate));
            self.retire_all(retired);
            existing.touch();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return existing;
        }

        if pool.entries.len() >= self.config.max_open
            && let Some(lru) = pool.pop_lru()
        {
            retired.push((lru, Retirement::Lru));
        }
        pool.insert(key, Arc::clone(&handle));
        assert!(
            pool.entries.len() <= self.config.max_open,
            "pool holds {} handles, max_open is {}",
            pool.entries.len(),
            self.config.max_open
        );
        drop(pool);
        self.retire_all(retired);

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        info!(path = %requested.display(), "opened bag handle");
        handle
    }

    /// Retire every handle idle for longer than the idle TTL
    ///
    /// Runs on every [`get_handle`](Self::get_handle); call it directly for
    /// housekeeping between requests. Returns the number of handles retired.
    pub fn sweep_idle(&self) -> usize {
        let idle = self.pool.lock().remove_idle(self.config.idle_ttl());
        let count = idle.len();
        self.retire_all(idle.into_iter().map(|h| (h, Retirement::Idle)).collect());
        count
    }

    /// Retire the handle for `path` regardless of its age or LRU position
    ///
    /// Works for bags that were deleted since they were opened. Returns
    /// whether a handle was retired.
    pub fn invalidate(&self, path: impl AsRef<Path>) -> bool {
        let realpath = lookup_path(path.as_ref());
        let removed = self.pool.lock().remove_where(|k| k.realpath == realpath);
        let found = !removed.is_empty();
        self.retire_all(
            removed
                .into_iter()
                .map(|h| (h, Retirement::Invalidated))
                .collect(),
        );
        found
    }

    /// Retire every handle
    pub fn clear(&self) {
        let all = self.pool.lock().remove_where(|_| true);
        let count = all.len();
        self.retire_all(
            all.into_iter()
                .map(|h| (h, Retirement::Invalidated))
                .collect(),
        );
        info!(handles = count, "cleared all bag handles");
    }

    /// Number of pooled handles
    pub fn len(&self) -> usize {
        self.pool.lock().entries.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.pool.lock().entries.is_empty()
    }

    /// Canonical paths of pooled bags, least recently used first
    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.pool
            .lock()
            .by_recency()
            .iter()
            .map(|h| h.key().realpath.clone())
            .collect()
    }

    /// Summaries of pooled handles, least recently used first
    pub fn handles(&self) -> Vec<HandleSummary> {
        let handles = self.pool.lock().by_recency();
        handles.iter().map(|h| h.summary()).collect()
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            open_count: self.len(),
            max_open: self.config.max_open,
            hit_count: self.counters.hits.load(Ordering::Relaxed),
            miss_count: self.counters.misses.load(Ordering::Relaxed),
            eviction_count: self.counters.evictions.load(Ordering::Relaxed),
            invalidation_count: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Close retired handles; must be called without the pool lock held
    fn retire_all(&self, retired: Vec<(Arc<Handle<O>>, Retirement)>) {
        for (handle, reason) in retired {
            match reason {
                Retirement::Lru | Retirement::Idle | Retirement::Stale => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                }
                Retirement::Invalidated => {
                    self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
                }
                Retirement::Duplicate => {}
            }

            debug!(
                path = %handle.key().realpath.display(),
                reason = reason.as_str(),
                "retiring bag handle"
            );
            if let Err(e) = handle.invalidate() {
                warn!(
                    path = %handle.key().realpath.display(),
                    error = %e,
                    "failed to close bag handle, dropping it anyway"
                );
            }
        }
    }
}

/// Path to match against pooled keys, even if the bag no longer exists
fn lookup_path(path: &Path) -> PathBuf {
    let expanded = expand_home(path);
    std::fs::canonicalize(&expanded)
        .or_else(|_| std::path::absolute(&expanded))
        .unwrap_or(expanded)
}
