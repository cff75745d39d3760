//! In-memory LRU layer backing tier 1 of [`super::DefaultCache`] (§4.2).
//!
//! Protected entries are held in a separate map that the eviction sweep never
//! touches, so `protect`/`release` is a pure move between the two maps rather
//! than a flag checked on every eviction candidate.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

use super::{CacheEntry, EvictionPolicy};

struct State {
    lru: LruCache<String, CacheEntry>,
    protected: HashMap<String, CacheEntry>,
    used_bytes: usize,
}

/// Bounded in-memory cache tier. `max_bytes == 0` disables it entirely; every
/// operation then becomes a cheap no-op miss, matching §6's
/// `max_memory_bytes: 0 disables memory LRU`.
pub struct MemoryLayer {
    max_bytes: usize,
    eviction_policy: EvictionPolicy,
    state: Mutex<State>,
}

/// Outcome of a [`MemoryLayer::put`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored successfully.
    Stored,
    /// Rejected: `eviction_policy == None` and the entry didn't fit.
    Full,
    /// The entry itself exceeds `max_bytes`; nothing was evicted for it and
    /// it was not stored, but the call still succeeds (§4.2 eviction policy).
    TooLargeForBudget,
}

impl MemoryLayer {
    /// Construct a layer with the given byte budget and eviction policy.
    pub fn new(max_bytes: usize, eviction_policy: EvictionPolicy) -> Self {
        MemoryLayer {
            max_bytes,
            eviction_policy,
            state: Mutex::new(State {
                // lru::LruCache requires a nonzero capacity; we bound evictions
                // ourselves by byte budget, so give it an effectively
                // unbounded entry count and let byte accounting do the work.
                lru: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
                protected: HashMap::new(),
                used_bytes: 0,
            }),
        }
    }

    /// `true` if this layer is configured on (`max_bytes > 0`).
    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    /// Look up `key`. Promotes it to MRU on hit. Entries past their expiry
    /// (and not protected) are evicted and treated as a miss.
    pub fn get(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state.lock();
        if let Some(entry) = state.protected.get(key) {
            return Some(entry.clone());
        }
        if let Some(entry) = state.lru.get(key) {
            if entry.is_expired(now) {
                let entry = state.lru.pop(key).unwrap();
                state.used_bytes -= entry.size;
                return None;
            }
            return Some(entry.clone());
        }
        None
    }

    /// Insert `entry` under `key`, evicting unprotected LRU entries as needed
    /// per `eviction_policy`.
    pub fn put(&self, key: String, entry: CacheEntry) -> PutOutcome {
        if !self.is_enabled() {
            return PutOutcome::Stored; // disabled layer: caller only persists.
        }
        if entry.size > self.max_bytes {
            return PutOutcome::TooLargeForBudget;
        }
        let mut state = self.state.lock();

        // Replacing an existing entry first frees its own budget.
        if let Some(old) = state.lru.pop(&key) {
            state.used_bytes -= old.size;
        }
        if let Some(old) = state.protected.remove(&key) {
            state.used_bytes -= old.size;
        }

        if state.used_bytes + entry.size > self.max_bytes {
            match self.eviction_policy {
                EvictionPolicy::None => return PutOutcome::Full,
                EvictionPolicy::LeastRecentlyUsed => {
                    while state.used_bytes + entry.size > self.max_bytes {
                        match state.lru.pop_lru() {
                            Some((_, evicted)) => {
                                state.used_bytes -= evicted.size;
                            }
                            None => {
                                // Nothing left to evict (everything remaining
                                // is protected); the entry doesn't fit.
                                return PutOutcome::TooLargeForBudget;
                            }
                        }
                    }
                }
            }
        }

        state.used_bytes += entry.size;
        state.lru.put(key, entry);
        PutOutcome::Stored
    }

    /// Remove `key` from whichever map holds it. No-op for protected entries
    /// and for unknown keys (both return normally).
    pub fn remove(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.lru.pop(key) {
            state.used_bytes -= entry.size;
        }
        // Protected entries are deliberately left untouched (§9 open question).
    }

    /// Remove every unprotected key starting with `prefix`.
    pub fn remove_with_prefix(&self, prefix: &str) {
        let mut state = self.state.lock();
        let matching: Vec<String> = state
            .lru
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in matching {
            if let Some(entry) = state.lru.pop(&key) {
                state.used_bytes -= entry.size;
            }
        }
    }

    /// Move matching present entries out of LRU eviction into the protected
    /// map, clearing their expiry. Returns the keys that were neither in the
    /// LRU nor already protected, so a caller can hydrate them from a
    /// persistent tier this layer has no access to.
    pub fn protect(&self, keys: &[String]) -> Vec<String> {
        let mut state = self.state.lock();
        let mut missing = Vec::new();
        for key in keys {
            if let Some(mut entry) = state.lru.pop(key) {
                entry.protected = true;
                entry.expiry = None;
                state.protected.insert(key.clone(), entry);
            } else if !state.protected.contains_key(key) {
                missing.push(key.clone());
            }
        }
        missing
    }

    /// Insert `entry` directly into the protected map, bypassing LRU
    /// eviction consideration. Used to hydrate a key that `protect` found
    /// only on a persistent tier this layer doesn't hold a handle to.
    pub fn insert_protected(&self, key: String, entry: CacheEntry) {
        let mut state = self.state.lock();
        if state.protected.contains_key(&key) {
            return;
        }
        state.used_bytes += entry.size;
        state.protected.insert(key, entry);
    }

    /// Move matching protected entries back into the LRU at the MRU end with
    /// a freshly computed expiry. Keys not currently protected are ignored.
    pub fn release(&self, keys: &[String], new_expiry: impl Fn() -> Option<Instant>) {
        let mut state = self.state.lock();
        for key in keys {
            if let Some(mut entry) = state.protected.remove(key) {
                entry.protected = false;
                entry.expiry = new_expiry();
                state.lru.put(key.clone(), entry);
            }
        }
    }

    /// Drop every entry, protected or not.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.protected.clear();
        state.used_bytes = 0;
    }

    /// Current bytes charged against the budget, across both maps.
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(payload: &[u8]) -> CacheEntry {
        CacheEntry {
            payload: Bytes::copy_from_slice(payload),
            expiry: None,
            protected: false,
            size: payload.len(),
        }
    }

    #[test]
    fn disabled_layer_is_always_a_miss() {
        let layer = MemoryLayer::new(0, EvictionPolicy::LeastRecentlyUsed);
        assert_eq!(layer.put("k".into(), entry(b"v")), PutOutcome::Stored);
        assert!(layer.get("k", Instant::now()).is_none());
    }

    #[test]
    fn none_policy_rejects_over_budget_writes() {
        let layer = MemoryLayer::new(4, EvictionPolicy::None);
        assert_eq!(layer.put("a".into(), entry(b"ab")), PutOutcome::Stored);
        assert_eq!(layer.put("b".into(), entry(b"abc")), PutOutcome::Full);
    }

    #[test]
    fn lru_policy_evicts_to_make_room() {
        let layer = MemoryLayer::new(4, EvictionPolicy::LeastRecentlyUsed);
        layer.put("a".into(), entry(b"ab"));
        layer.put("b".into(), entry(b"cd"));
        assert!(layer.get("a", Instant::now()).is_some());
        // Touching "a" makes "b" the LRU victim.
        layer.put("c".into(), entry(b"ef"));
        assert!(layer.get("a", Instant::now()).is_some());
        assert!(layer.get("b", Instant::now()).is_none());
    }

    #[test]
    fn oversized_entry_not_stored_but_call_succeeds() {
        let layer = MemoryLayer::new(4, EvictionPolicy::LeastRecentlyUsed);
        let outcome = layer.put("big".into(), entry(b"toolong"));
        assert_eq!(outcome, PutOutcome::TooLargeForBudget);
        assert!(layer.get("big", Instant::now()).is_none());
    }

    #[test]
    fn protect_survives_eviction_pressure() {
        let layer = MemoryLayer::new(4, EvictionPolicy::LeastRecentlyUsed);
        layer.put("a".into(), entry(b"ab"));
        layer.protect(&["a".to_string()]);
        layer.put("b".into(), entry(b"cd"));
        layer.put("c".into(), entry(b"ef"));
        assert!(layer.get("a", Instant::now()).is_some());
    }

    #[test]
    fn release_reinserts_into_lru() {
        let layer = MemoryLayer::new(100, EvictionPolicy::LeastRecentlyUsed);
        layer.put("a".into(), entry(b"ab"));
        layer.protect(&["a".to_string()]);
        layer.release(&["a".to_string()], || None);
        assert!(layer.get("a", Instant::now()).is_some());
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let layer = MemoryLayer::new(100, EvictionPolicy::LeastRecentlyUsed);
        let mut e = entry(b"v");
        e.expiry = Some(Instant::now() - std::time::Duration::from_secs(1));
        layer.put("a".into(), e);
        assert!(layer.get("a", Instant::now()).is_none());
    }
}
