//! Memory Cache (C2) — process-local LRU in front of the Cache Store.
//!
//! A miss here falls through to C1; a C1 hit populates this layer.
//! Overflow triggers eviction once the map exceeds `1.2·M` entries,
//! reducing back down to `0.7·M` by dropping the oldest-accessed
//! entries first (hysteresis avoids evicting on every single insert
//! once the cache is near its bound).

use std::sync::Mutex;

use lru::LruCache;

use crate::domain::ContextFingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    source: String,
    fingerprint: ContextFingerprint,
    model: String,
}

pub struct MemoryCache {
    bound: usize,
    inner: Mutex<LruCache<Key, String>>,
}

impl MemoryCache {
    /// `bound` is `M` from the spec; the cache is allowed to grow to
    /// `1.2·M` before an eviction pass brings it back to `0.7·M`.
    /// The underlying `LruCache` is unbounded so we control the
    /// hysteresis ourselves rather than relying on its built-in
    /// one-in-one-out capacity eviction.
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            bound,
            inner: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn get(&self, source: &str, fingerprint: ContextFingerprint, model: &str) -> Option<String> {
        let key = Key {
            source: source.to_string(),
            fingerprint,
            model: model.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.get(&key).cloned()
    }

    pub fn put(&self, source: &str, target: &str, fingerprint: ContextFingerprint, model: &str) {
        let key = Key {
            source: source.to_string(),
            fingerprint,
            model: model.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.put(key, target.to_string());
        self.maybe_evict(&mut inner);
    }

    fn maybe_evict(&self, inner: &mut LruCache<Key, String>) {
        let ceiling = ((self.bound as f64 * 1.2).ceil() as usize).max(self.bound + 1);
        if inner.len() < ceiling {
            return;
        }
        let floor = ((self.bound as f64 * 0.7).floor() as usize).max(1);
        while inner.len() > floor {
            // `LruCache::pop_lru` removes the least-recently-used
            // entry, which is exactly "oldest `last_accessed`".
            if inner.pop_lru().is_none() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
