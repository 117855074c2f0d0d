//! Result cache.
//!
//! Results are assembled incrementally from the batches of a running query
//! and promoted into a [`CacheStore`] once the terminal batch arrives. At
//! most one request assembles a given id at a time. A result that grows past
//! `max_size_bytes` is discarded and its id poisoned so later attempts do not
//! repeat the work. Store failures degrade to cache misses.

mod id;
mod node;
mod policy;
mod results;
mod sizing;
mod store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strata_common::config::{CacheScope, CacheSettings, EvictionPolicy, SizeEstimation};
use strata_error::{ErrorCode, ErrorContext, StrataError};
use tracing::{debug, info, warn};

pub use id::{normalize_sql, CacheId, ScopeKey};
pub use node::CachingNode;
pub use results::{CacheResults, PartialResults};
pub use sizing::{estimator_for, ApproximateEstimator, ExactEstimator, SizeEstimator};
pub use store::{BufferBackedStore, CacheStore, MemoryStore};

use policy::PolicyTracker;

use crate::types::RowRange;

#[derive(Debug, Clone)]
pub struct ResultCacheOptions {
    pub max_size_bytes: usize,
    pub max_age: Option<Duration>,
    pub max_entries: usize,
    pub eviction_policy: EvictionPolicy,
    pub scope: CacheScope,
    pub size_estimation: SizeEstimation,
    pub max_poisoned_ids: u64,
}

impl Default for ResultCacheOptions {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for ResultCacheOptions {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            max_size_bytes: settings.max_size_bytes,
            max_age: settings.max_age(),
            max_entries: settings.max_entries.max(1),
            eviction_policy: settings.eviction_policy,
            scope: settings.scope,
            size_estimation: settings.size_estimation,
            max_poisoned_ids: settings.max_poisoned_ids,
        }
    }
}

/// Identifies the request allowed to assemble an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestToken(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub assembling: usize,
    pub hits: u64,
    pub misses: u64,
    pub poisoned: u64,
    pub evictions: u64,
    /// `set_results` calls refused for a poisoned id, a foreign token, a
    /// gap or the size budget.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
    tokens: AtomicU64,
}

/// Ids whose results outgrew the budget, oldest first. Past `capacity` the
/// oldest id is forgotten.
struct PoisonedIds {
    ids: HashSet<CacheId>,
    order: VecDeque<CacheId>,
    capacity: usize,
}

impl PoisonedIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &CacheId) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: CacheId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct Assembly {
    token: RequestToken,
    results: Option<CacheResults>,
}

pub struct ResultCache {
    options: ResultCacheOptions,
    store: Arc<dyn CacheStore>,
    estimator: Arc<dyn SizeEstimator>,
    assembling: Mutex<HashMap<CacheId, Assembly>>,
    tracker: Mutex<PolicyTracker>,
    poisoned: Mutex<PoisonedIds>,
    counters: Counters,
}

impl ResultCache {
    pub fn new(options: ResultCacheOptions, store: Arc<dyn CacheStore>) -> Self {
        info!(
            target: "cache",
            store = store.name(),
            max_size_bytes = options.max_size_bytes,
            max_entries = options.max_entries,
            max_age_seconds = options.max_age.map(|d| d.as_secs()),
            eviction_policy = ?options.eviction_policy,
            "Initializing result cache"
        );
        let poisoned = Mutex::new(PoisonedIds::new(options.max_poisoned_ids as usize));
        Self {
            estimator: estimator_for(options.size_estimation),
            tracker: Mutex::new(PolicyTracker::new(options.eviction_policy)),
            assembling: Mutex::new(HashMap::new()),
            poisoned,
            counters: Counters::default(),
            store,
            options,
        }
    }

    pub fn in_memory(options: ResultCacheOptions) -> Self {
        Self::new(options, Arc::new(MemoryStore::new()))
    }

    pub fn options(&self) -> &ResultCacheOptions {
        &self.options
    }

    pub fn new_request_token(&self) -> RequestToken {
        RequestToken(self.counters.tokens.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Whether results for `id` were discarded for exceeding the budget.
    pub fn is_poisoned(&self, id: &CacheId) -> bool {
        self.poisoned.lock().contains(id)
    }

    pub fn has_results(&self, id: &CacheId) -> bool {
        !self.expire_if_stale(id) && self.store.contains(id)
    }

    /// Cached rows inside `range`: the stored object when the range covers
    /// it, otherwise a slice.
    pub fn get_results(&self, id: &CacheId, range: RowRange) -> Option<Arc<CacheResults>> {
        if self.expire_if_stale(id) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let stored = match self.store.get(id) {
            Ok(Some(results)) => results,
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(target: "cache", cache_id = %id, error = %e, "Cache read failed, treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        self.tracker.lock().on_access(id);
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(target: "cache", cache_id = %id, begin = range.begin, end = range.end, "Cache hit");
        if stored.covers(range) {
            Some(stored)
        } else {
            stored.slice(range).map(Arc::new)
        }
    }

    /// Claim `id` for assembly by `token`. Fails when the id is poisoned,
    /// already cached or claimed by another request.
    pub fn begin_assembly(&self, id: &CacheId, token: RequestToken) -> bool {
        if self.is_poisoned(id) || self.has_results(id) {
            return false;
        }
        let mut assembling = self.assembling.lock();
        match assembling.get(id) {
            Some(assembly) => assembly.token == token,
            None => {
                assembling.insert(
                    id.clone(),
                    Assembly {
                        token,
                        results: None,
                    },
                );
                true
            }
        }
    }

    /// Add a partial run to the entry `token` is assembling, claiming the id
    /// first if nobody holds it. Returns false when the rows were refused;
    /// the entry is then gone.
    pub fn set_results(&self, id: &CacheId, partial: PartialResults, token: RequestToken) -> bool {
        if self.is_poisoned(id) {
            return self.reject(id, "id is poisoned");
        }
        let mut assembling = self.assembling.lock();
        match assembling.get(id) {
            Some(assembly) if assembly.token != token => {
                return self.reject(id, "another request is assembling this id");
            }
            Some(_) => {}
            None => {
                if self.store.contains(id) {
                    return self.reject(id, "results already cached");
                }
                assembling.insert(
                    id.clone(),
                    Assembly {
                        token,
                        results: None,
                    },
                );
            }
        }

        let is_last = partial.is_last;
        let added = self.estimator.estimate_rows(&partial.rows);
        let appended = match assembling.get_mut(id) {
            Some(assembly) => {
                let results = assembly
                    .results
                    .get_or_insert_with(|| CacheResults::new(partial.schema.clone(), partial.first_row));
                results.append(partial, added).map(|_| results.size_bytes())
            }
            None => return false,
        };

        match appended {
            Err(e) => {
                assembling.remove(id);
                self.reject(id, &e.message)
            }
            Ok(size) if size > self.options.max_size_bytes => {
                assembling.remove(id);
                self.poisoned.lock().insert(id.clone());
                let err = StrataError::new(
                    ErrorCode::CacheBudgetExceeded,
                    format!("Result for {} exceeds the cache size budget", id),
                )
                .with_context(ErrorContext::CacheBudget {
                    cache_id: id.as_str().to_string(),
                    size_bytes: size,
                    max_size_bytes: self.options.max_size_bytes,
                });
                warn!(target: "cache", cache_id = %id, error = %err, "Discarding oversized result");
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            Ok(_) if is_last => match assembling.remove(id).and_then(|a| a.results) {
                Some(results) => self.promote(id, results),
                None => false,
            },
            Ok(_) => true,
        }
    }

    /// Drop an incomplete entry held by `token`.
    pub fn abort_assembly(&self, id: &CacheId, token: RequestToken) -> bool {
        let mut assembling = self.assembling.lock();
        if assembling.get(id).is_some_and(|a| a.token == token) {
            assembling.remove(id);
            debug!(target: "cache", cache_id = %id, "Aborted cache assembly");
            true
        } else {
            false
        }
    }

    pub fn remove(&self, id: &CacheId) -> bool {
        self.tracker.lock().remove(id);
        self.remove_from_store(id)
    }

    /// Drop every stored and assembling entry and forget poisoned ids.
    pub fn clear(&self) {
        self.assembling.lock().clear();
        self.tracker.lock().clear();
        if let Err(e) = self.store.clear() {
            warn!(target: "cache", error = %e, "Failed to clear cache store");
        }
        self.poisoned.lock().clear();
        info!(target: "cache", "Cleared result cache");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.store.len(),
            assembling: self.assembling.lock().len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            poisoned: self.poisoned.lock().len() as u64,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, id: &CacheId, reason: &str) -> bool {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(target: "cache", cache_id = %id, reason, "Rejected cache results");
        false
    }

    /// Move a complete entry into the store, making room first.
    fn promote(&self, id: &CacheId, results: CacheResults) -> bool {
        let now = Instant::now();
        let mut tracker = self.tracker.lock();
        if let Some(max_age) = self.options.max_age {
            for stale in tracker.expired(now, max_age) {
                tracker.remove(&stale);
                self.remove_from_store(&stale);
            }
        }
        while tracker.len() >= self.options.max_entries {
            let Some(victim) = tracker.victim() else {
                break;
            };
            tracker.remove(&victim);
            self.remove_from_store(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(target: "cache", cache_id = %victim, policy = ?self.options.eviction_policy, "Evicted cache entry");
        }

        let rows = results.row_count();
        let size_bytes = results.size_bytes();
        if let Err(e) = self.store.put(id.clone(), Arc::new(results)) {
            warn!(target: "cache", cache_id = %id, error = %e, "Failed to store cache entry");
            return false;
        }
        tracker.on_insert(id.clone(), now);
        info!(target: "cache", cache_id = %id, rows, size_bytes, "Cached query result");
        true
    }

    /// Drop `id` when it outlived `max_age`. Returns whether it did.
    fn expire_if_stale(&self, id: &CacheId) -> bool {
        let Some(max_age) = self.options.max_age else {
            return false;
        };
        let mut tracker = self.tracker.lock();
        if !tracker.is_expired(id, Instant::now(), max_age) {
            return false;
        }
        tracker.remove(id);
        drop(tracker);
        self.remove_from_store(id);
        debug!(target: "cache", cache_id = %id, "Expired cache entry");
        true
    }

    fn remove_from_store(&self, id: &CacheId) -> bool {
        match self.store.remove(id) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(target: "cache", cache_id = %id, error = %e, "Failed to remove cache entry");
                false
            }
        }
    }
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("store", &self.store.name())
            .field("options", &self.options)
            .finish()
    }
}
