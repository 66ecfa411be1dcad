//! Read-through cache of view query results.
//!
//! Entries are keyed by `(view, canonical params)` and tagged with the checkpoint
//! they were computed at. A hit requires that tag to equal the view's current
//! checkpoint, so a cached answer is always one the view would give right now.
//! Entries are immutable `Arc`s replaced wholesale; an older result never replaces
//! a newer one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::debug;

use stocklens_core::GlobalVersion;
use stocklens_events::QueryParams;

use crate::projections::{CheckpointListener, QueryResult};

pub const DEFAULT_CAPACITY: usize = 1024;

/// A full cache drops `capacity / EVICTION_BATCH_DIVISOR` entries (at least one) per scan.
const EVICTION_BATCH_DIVISOR: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    view: String,
    /// Parameters serialized with sorted object keys.
    params: String,
}

impl CacheKey {
    fn new(view: &str, params: &QueryParams) -> Self {
        // serde_json maps are ordered, so equal values serialize identically.
        Self {
            view: view.to_string(),
            params: params.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// In-process query cache.
#[derive(Debug)]
pub struct QueryCache {
    entries: DashMap<CacheKey, Arc<QueryResult>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the cached answer if it was computed at `current_checkpoint`,
    /// otherwise run `compute` (no lock held) and publish its result.
    ///
    /// Concurrent misses on one key may both compute; the newest checkpoint wins.
    pub fn get_or_compute<E>(
        &self,
        view: &str,
        params: &QueryParams,
        current_checkpoint: GlobalVersion,
        compute: impl FnOnce() -> Result<QueryResult, E>,
    ) -> Result<Arc<QueryResult>, E> {
        let key = CacheKey::new(view, params);

        let cached = self.entries.get(&key).map(|e| Arc::clone(e.value()));
        if let Some(hit) = cached.filter(|c| c.checkpoint == current_checkpoint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let fresh = Arc::new(compute()?);
        self.publish(key, Arc::clone(&fresh));
        Ok(fresh)
    }

    fn publish(&self, key: CacheKey, fresh: Arc<QueryResult>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest((self.capacity / EVICTION_BATCH_DIVISOR).max(1));
        }
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().checkpoint <= fresh.checkpoint {
                    slot.insert(fresh);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
    }

    /// Drop the `count` entries with the oldest checkpoints in one pass, so the
    /// scan runs once per batch of inserts rather than on every insert.
    fn evict_oldest(&self, count: usize) {
        let mut candidates: Vec<(GlobalVersion, CacheKey)> = self
            .entries
            .iter()
            .map(|e| (e.value().checkpoint, e.key().clone()))
            .collect();
        let count = count.min(candidates.len());
        if count == 0 {
            return;
        }
        if count < candidates.len() {
            candidates.select_nth_unstable_by_key(count - 1, |(checkpoint, _)| *checkpoint);
        }

        let mut evicted = 0_u64;
        for (_, key) in candidates.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, capacity = self.capacity, "query cache evicted oldest entries");
    }

    /// Drop `view`'s entries computed before `checkpoint`.
    pub fn invalidate_before(&self, view: &str, checkpoint: GlobalVersion) -> usize {
        self.remove_where(|k, v| k.view == view && v.checkpoint < checkpoint)
    }

    pub fn invalidate_view(&self, view: &str) -> usize {
        self.remove_where(|k, _| k.view == view)
    }

    pub fn clear(&self) {
        let n = self.entries.len();
        self.entries.clear();
        self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn remove_where(&self, pred: impl Fn(&CacheKey, &QueryResult) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| !pred(k, &**v));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl CheckpointListener for QueryCache {
    fn checkpoint_advanced(&self, view: &str, checkpoint: GlobalVersion) {
        let removed = self.invalidate_before(view, checkpoint);
        if removed > 0 {
            debug!(view, checkpoint, removed, "query cache invalidated");
        }
    }

    fn view_reset(&self, view: &str) {
        self.invalidate_view(view);
    }
}
