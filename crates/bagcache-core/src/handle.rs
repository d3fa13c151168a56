//! Bag handles
//!
//! A [`Handle`] owns one bag's resource and everything derived from it:
//!
//! - the opened resource, behind a scoped [`ResourceGuard`]
//! - a small metadata store (bag summary, schema samples)
//! - per-series [`TopicTimeIndex`]es
//! - a [`RecordCache`] for small series
//!
//! Handles are created and retired only by the [`Manager`](crate::Manager).
//! Retiring never waits for a lease: it marks the handle retired, drops the
//! derived caches and closes the resource right away if it is idle. When a
//! [`ResourceGuard`] is outstanding, whoever releases the resource lock
//! last closes it. Any later [`Handle::acquire`] fails with
//! [`Error::Retired`].

use crate::index::TopicTimeIndex;
use crate::key::BagKey;
use crate::records::{RecordCache, RecordCacheStats};
use crate::resource::{BagOpener, BagResource};
use crate::slru::{SizeAwareSlru, SlruStats};
use bagcache_common::{CacheConfig, Error, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Lifecycle of the resource owned by a handle
enum Slot<R> {
    /// Not opened yet
    Closed,
    Open(R),
    /// Closed for good
    Retired,
}

/// Resource slot plus lock-free lifecycle flags
struct ResourceCell<R> {
    slot: Mutex<Slot<R>>,
    /// Set once by the pool; never cleared
    retired: AtomicBool,
    /// Whether the slot currently holds an open resource
    open: AtomicBool,
}

impl<R: BagResource> ResourceCell<R> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Closed),
            retired: AtomicBool::new(false),
            open: AtomicBool::new(false),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Close an open resource and mark the slot retired; caller holds the lock
    fn close_locked(&self, slot: &mut Slot<R>, path: &Path) -> Result<()> {
        match std::mem::replace(slot, Slot::Retired) {
            Slot::Open(mut resource) => {
                self.open.store(false, Ordering::SeqCst);
                debug!(path = %path.display(), "closing bag resource");
                resource.close().map_err(|source| Error::CloseFailed {
                    path: path.to_path_buf(),
                    source,
                })
            }
            Slot::Closed | Slot::Retired => Ok(()),
        }
    }

    /// Close the resource if the handle was retired while the lock was held
    ///
    /// Must be called after releasing the slot lock. If someone else holds
    /// the lock by now, they run this check on their own release.
    fn close_if_retired(&self, path: &Path) {
        if !self.is_retired() {
            return;
        }
        if let Some(mut slot) = self.slot.try_lock()
            && let Err(e) = self.close_locked(&mut slot, path)
        {
            warn!(path = %path.display(), error = %e, "failed to close retired bag resource");
        }
    }
}

/// Runs the deferred close once the guard's lock has been released
struct Release<'a, R: BagResource> {
    cell: &'a ResourceCell<R>,
    path: &'a Path,
}

impl<R: BagResource> Drop for Release<'_, R> {
    fn drop(&mut self) {
        trace!(path = %self.path.display(), "released bag resource");
        self.cell.close_if_retired(self.path);
    }
}

/// Scoped access to an opened bag
///
/// Holding the guard keeps the handle's resource locked for the caller.
/// Dropping it releases the resource on every exit path, including early
/// returns and unwinding.
pub struct ResourceGuard<'a, R: BagResource> {
    // Field order matters: the lock is released before `_release` runs.
    inner: MappedMutexGuard<'a, R>,
    _release: Release<'a, R>,
}

impl<R: BagResource> Deref for ResourceGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.inner
    }
}

impl<R: BagResource> DerefMut for ResourceGuard<'_, R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

/// Serializable view of a handle for inspection
#[derive(Debug, Clone, Serialize)]
pub struct HandleSummary {
    pub path: PathBuf,
    pub key: BagKey,
    pub open: bool,
    pub indexed_series: Vec<String>,
    pub metadata_keys: Vec<String>,
    pub metadata: SlruStats,
    pub records: RecordCacheStats,
    pub idle_secs: f64,
}

/// One bag with its per-bag caches
pub struct Handle<O: BagOpener> {
    key: BagKey,
    /// Path as requested by the caller (home-expanded)
    path: PathBuf,
    opener: Arc<O>,
    resource: ResourceCell<O::Resource>,
    metadata: SizeAwareSlru<String, serde_json::Value>,
    indexes: Mutex<HashMap<String, Arc<TopicTimeIndex>>>,
    records: RecordCache,
    last_access: Mutex<Instant>,
}

impl<O: BagOpener> fmt::Debug for Handle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

impl<O: BagOpener> Handle<O> {
    pub(crate) fn new(key: BagKey, path: PathBuf, opener: Arc<O>, config: &CacheConfig) -> Self {
        Self {
            key,
            path,
            opener,
            resource: ResourceCell::new(),
            metadata: SizeAwareSlru::new(config.metadata.max_bytes, config.metadata.ttl()),
            indexes: Mutex::new(HashMap::new()),
            records: RecordCache::new(config.records.clone()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    /// Identity this handle was opened for
    pub const fn key(&self) -> &BagKey {
        &self.key
    }

    /// Path as requested
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Per-bag metadata store
    ///
    /// The store is emptied when the handle is retired. Values put into a
    /// retired handle are dropped with it.
    pub const fn metadata(&self) -> &SizeAwareSlru<String, serde_json::Value> {
        &self.metadata
    }

    /// Per-bag record cache
    pub const fn records(&self) -> &RecordCache {
        &self.records
    }

    /// Record an access for idle tracking
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    /// Time since the last access
    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Check if the resource is currently open
    pub fn is_open(&self) -> bool {
        self.resource.open.load(Ordering::SeqCst)
    }

    /// Check if the pool has retired this handle
    pub fn is_retired(&self) -> bool {
        self.resource.is_retired()
    }

    /// Open the resource if it is not open yet
    pub(crate) fn open(&self) -> Result<()> {
        let mut slot = self.resource.slot.lock();
        let result = self.open_locked(&mut slot);
        drop(slot);
        self.resource.close_if_retired(&self.key.realpath);
        result
    }

    fn open_locked(&self, slot: &mut Slot<O::Resource>) -> Result<()> {
        if self.resource.is_retired() {
            if let Err(e) = self.resource.close_locked(slot, &self.key.realpath) {
                warn!(path = %self.key.realpath.display(), error = %e, "failed to close retired bag resource");
            }
            return Err(Error::Retired {
                path: self.key.realpath.clone(),
            });
        }
        match *slot {
            Slot::Open(_) => Ok(()),
            Slot::Retired => Err(Error::Retired {
                path: self.key.realpath.clone(),
            }),
            Slot::Closed => {
                let resource =
                    self.opener
                        .open(&self.key.realpath)
                        .map_err(|source| Error::OpenFailed {
                            path: self.key.realpath.clone(),
                            source,
                        })?;
                *slot = Slot::Open(resource);
                self.resource.open.store(true, Ordering::SeqCst);
                debug!(path = %self.key.realpath.display(), "opened bag resource");
                Ok(())
            }
        }
    }

    /// Borrow the opened resource for the lifetime of the returned guard
    ///
    /// Opens the resource first if needed and resets it, so every lease
    /// starts from a clean state. Acquisitions on the same handle are
    /// serialized.
    pub fn acquire(&self) -> Result<ResourceGuard<'_, O::Resource>> {
        self.touch();
        let mut slot = self.resource.slot.lock();
        self.open_locked(&mut slot)?;

        let inner = MutexGuard::map(slot, |slot| match slot {
            Slot::Open(resource) => resource,
            Slot::Closed | Slot::Retired => unreachable!("slot opened above"),
        });
        let mut guard = ResourceGuard {
            inner,
            _release: Release {
                cell: &self.resource,
                path: &self.key.realpath,
            },
        };
        guard.reset()?;
        Ok(guard)
    }

    /// Cached index for a series, if one was built
    pub fn cached_index(&self, series_id: &str) -> Option<Arc<TopicTimeIndex>> {
        self.indexes.lock().get(series_id).cloned()
    }

    /// Return the index for `series_id`, building it from `scan` on a miss
    ///
    /// `scan` performs one full pass over the series and returns its
    /// timestamps in order. It runs without any handle lock held. If it
    /// fails, nothing is cached and the error is returned as is. On a
    /// retired handle the built index is returned but not cached.
    pub fn get_or_build_index<F, E>(
        &self,
        series_id: &str,
        scan: F,
    ) -> std::result::Result<Arc<TopicTimeIndex>, E>
    where
        F: FnOnce() -> std::result::Result<Vec<i64>, E>,
    {
        self.touch();
        if let Some(index) = self.cached_index(series_id) {
            return Ok(index);
        }

        let built = Arc::new(TopicTimeIndex::build(series_id, scan()?));
        let mut indexes = self.indexes.lock();
        if self.is_retired() {
            return Ok(built);
        }
        let index = indexes
            .entry(series_id.to_string())
            .or_insert_with(|| {
                debug!(
                    series = series_id,
                    timestamps = built.len(),
                    bytes = built.size_bytes(),
                    "cached time index"
                );
                Arc::clone(&built)
            })
            .clone();
        Ok(index)
    }

    /// Forget the index for a series so the next lookup rebuilds it
    pub fn drop_index(&self, series_id: &str) -> bool {
        self.indexes.lock().remove(series_id).is_some()
    }

    /// Retire the handle: drop every derived cache and close the resource
    ///
    /// Never waits for an outstanding [`ResourceGuard`]; if one is held,
    /// the resource is closed when it is released and `Ok` is returned
    /// here. A close failure is reported only when the close runs now.
    pub(crate) fn invalidate(&self) -> Result<()> {
        self.resource.retired.store(true, Ordering::SeqCst);
        // Taken after the flag so a concurrent index build sees it.
        self.indexes.lock().clear();
        self.metadata.clear();
        self.records.clear();

        match self.resource.slot.try_lock() {
            Some(mut slot) => self.resource.close_locked(&mut slot, &self.key.realpath),
            None => {
                debug!(
                    path = %self.key.realpath.display(),
                    "bag resource in use, closing on release"
                );
                Ok(())
            }
        }
    }

    /// Snapshot of the handle's state
    pub fn summary(&self) -> HandleSummary {
        let mut indexed_series: Vec<String> = self.indexes.lock().keys().cloned().collect();
        indexed_series.sort();
        HandleSummary {
            path: self.path.clone(),
            key: self.key.clone(),
            open: self.is_open(),
            indexed_series,
            metadata_keys: self.metadata.keys(),
            metadata: self.metadata.stats(),
            records: self.records.stats(),
            idle_secs: self.idle_for().as_secs_f64(),
        }
    }
}

impl<O: BagOpener> Drop for Handle<O> {
    fn drop(&mut self) {
        if let Slot::Open(mut resource) =
            std::mem::replace(self.resource.slot.get_mut(), Slot::Retired)
            && let Err(e) = resource.close()
        {
            warn!(
                path = %self.key.realpath.display(),
                error = %e,
                "failed to close bag resource on drop"
            );
        }
    }
}
