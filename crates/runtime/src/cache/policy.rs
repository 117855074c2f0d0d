use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use strata_common::config::EvictionPolicy;

use super::id::CacheId;

#[derive(Debug)]
struct EntryMeta {
    rank: u64,
    seq: u64,
    inserted: Instant,
}

/// Orders stored entries for eviction.
///
/// Entries sit in a map keyed by `(rank, seq)`. The rank is the last access
/// tick for LRU and MRU, the insertion tick for FIFO and the hit count for
/// LFU; `seq` breaks ties by insertion order.
#[derive(Debug)]
pub(crate) struct PolicyTracker {
    policy: EvictionPolicy,
    order: BTreeMap<(u64, u64), CacheId>,
    meta: HashMap<CacheId, EntryMeta>,
    clock: u64,
}

impl PolicyTracker {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            order: BTreeMap::new(),
            meta: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn on_insert(&mut self, id: CacheId, now: Instant) {
        self.remove(&id);
        let seq = self.tick();
        let rank = match self.policy {
            EvictionPolicy::Lfu => 0,
            _ => seq,
        };
        self.order.insert((rank, seq), id.clone());
        self.meta.insert(
            id,
            EntryMeta {
                rank,
                seq,
                inserted: now,
            },
        );
    }

    pub(crate) fn on_access(&mut self, id: &CacheId) {
        if self.policy == EvictionPolicy::Fifo {
            return;
        }
        let tick = self.tick();
        let Some(meta) = self.meta.get_mut(id) else {
            return;
        };
        self.order.remove(&(meta.rank, meta.seq));
        meta.rank = match self.policy {
            EvictionPolicy::Lfu => meta.rank + 1,
            _ => tick,
        };
        self.order.insert((meta.rank, meta.seq), id.clone());
    }

    pub(crate) fn remove(&mut self, id: &CacheId) -> bool {
        match self.meta.remove(id) {
            Some(meta) => {
                self.order.remove(&(meta.rank, meta.seq));
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.meta.clear();
    }

    /// Next entry to evict.
    pub(crate) fn victim(&self) -> Option<CacheId> {
        let entry = match self.policy {
            EvictionPolicy::Mru => self.order.iter().next_back(),
            _ => self.order.iter().next(),
        };
        entry.map(|(_, id)| id.clone())
    }

    pub(crate) fn is_expired(&self, id: &CacheId, now: Instant, max_age: Duration) -> bool {
        self.meta
            .get(id)
            .is_some_and(|m| now.saturating_duration_since(m.inserted) >= max_age)
    }

    /// Entries older than `max_age`.
    pub(crate) fn expired(&self, now: Instant, max_age: Duration) -> Vec<CacheId> {
        self.meta
            .iter()
            .filter(|(_, m)| now.saturating_duration_since(m.inserted) >= max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.meta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::id::ScopeKey;

    fn id(sql: &str) -> CacheId {
        CacheId::compute(sql, &[], &ScopeKey::Connection { session_id: 1 }).unwrap()
    }

    fn tracker(policy: EvictionPolicy) -> (PolicyTracker, CacheId, CacheId, CacheId) {
        let mut t = PolicyTracker::new(policy);
        let (a, b, c) = (id("a"), id("b"), id("c"));
        let now = Instant::now();
        t.on_insert(a.clone(), now);
        t.on_insert(b.clone(), now);
        t.on_insert(c.clone(), now);
        (t, a, b, c)
    }

    #[test]
    fn test_lru_evicts_least_recent() {
        let (mut t, a, b, _) = tracker(EvictionPolicy::Lru);
        t.on_access(&a);
        assert_eq!(t.victim(), Some(b));
    }

    #[test]
    fn test_mru_evicts_most_recent() {
        let (mut t, a, _, _) = tracker(EvictionPolicy::Mru);
        t.on_access(&a);
        assert_eq!(t.victim(), Some(a));
    }

    #[test]
    fn test_fifo_ignores_access() {
        let (mut t, a, _, _) = tracker(EvictionPolicy::Fifo);
        t.on_access(&a);
        t.on_access(&a);
        assert_eq!(t.victim(), Some(a));
    }

    #[test]
    fn test_lfu_evicts_least_hit_oldest_first() {
        let (mut t, a, b, c) = tracker(EvictionPolicy::Lfu);
        t.on_access(&a);
        t.on_access(&c);
        assert_eq!(t.victim(), Some(b.clone()));
        t.remove(&b);
        t.on_access(&a);
        assert_eq!(t.victim(), Some(c));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_expired_by_age() {
        let mut t = PolicyTracker::new(EvictionPolicy::Lru);
        let old = id("old");
        let start = Instant::now();
        t.on_insert(old.clone(), start);
        let later = start + Duration::from_secs(10);
        assert_eq!(t.expired(later, Duration::from_secs(5)), vec![old.clone()]);
        assert!(t.is_expired(&old, later, Duration::from_secs(5)));
        assert!(t.expired(later, Duration::from_secs(60)).is_empty());
    }
}
