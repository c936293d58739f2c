//! Shared pinned-prefix cache
//!
//! Sessions sharing identical pinned-prefix bytes reuse one cached entry,
//! keyed by a hash of the prefix text. Read-mostly: writes happen only when
//! a new prefix is observed. Bounded with LRU eviction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::PinnedPrefix;

struct CacheSlot {
    key: u64,
    prefix: Arc<PinnedPrefix>,
    last_used: u64,
}

/// LRU cache of pinned prefixes, shared across sessions.
pub struct PrefixCache {
    slots: Mutex<Vec<CacheSlot>>,
    capacity: usize,
    tick: Mutex<u64>,
}

impl PrefixCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            tick: Mutex::new(0),
        }
    }

    fn hash_text(text: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        hasher.finish()
    }

    fn next_tick(&self) -> u64 {
        let mut tick = self.tick.lock();
        *tick += 1;
        *tick
    }

    /// Look up or insert the prefix for `text`. Returns the cache key (for
    /// adapter-level prefix reuse) and a shared handle to the entry.
    pub fn get_or_insert(&self, text: &str) -> (u64, Arc<PinnedPrefix>) {
        let key = Self::hash_text(text);
        let tick = self.next_tick();
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.iter_mut().find(|s| s.key == key) {
            slot.last_used = tick;
            return (key, slot.prefix.clone());
        }

        let prefix = Arc::new(PinnedPrefix::new(text));
        if slots.len() >= self.capacity {
            if let Some(idx) = slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, _)| i)
            {
                slots.swap_remove(idx);
            }
        }
        slots.push(CacheSlot {
            key,
            prefix: prefix.clone(),
            last_used: tick,
        });
        (key, prefix)
    }

    pub fn contains(&self, text: &str) -> bool {
        let key = Self::hash_text(text);
        self.slots.lock().iter().any(|s| s.key == key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_prefixes_share_one_entry() {
        let cache = PrefixCache::new(8);
        let (key_a, prefix_a) = cache.get_or_insert("you are a helpful agent");
        let (key_b, prefix_b) = cache.get_or_insert("you are a helpful agent");
        assert_eq!(key_a, key_b);
        assert!(Arc::ptr_eq(&prefix_a, &prefix_b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn distinct_prefixes_get_distinct_keys() {
        let cache = PrefixCache::new(8);
        let (key_a, _) = cache.get_or_insert("persona one");
        let (key_b, _) = cache.get_or_insert("persona two");
        assert_ne!(key_a, key_b);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_removes_least_recently_used() {
        let cache = PrefixCache::new(2);
        cache.get_or_insert("alpha");
        cache.get_or_insert("beta");
        // Touch alpha so beta becomes LRU.
        cache.get_or_insert("alpha");
        cache.get_or_insert("gamma");
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("alpha"));
        assert!(cache.contains("gamma"));
        assert!(!cache.contains("beta"));
    }
}
