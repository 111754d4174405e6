//! LRU cache of opened sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::source::TableHandle;

/// A cached value with access metadata
#[derive(Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_accessed: now,
            access_count: 1,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Opened sources keyed by locator, evicting the least recently used.
///
/// Not synchronized; the extractor keeps it behind a mutex.
pub struct SourceCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry<Arc<dyn TableHandle>>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl SourceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<Arc<dyn TableHandle>> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch();
                self.hits += 1;
                Some(Arc::clone(&entry.value))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `handle`, returning the key evicted to make room.
    pub fn insert(&mut self, key: String, handle: Arc<dyn TableHandle>) -> Option<String> {
        let mut evicted = None;
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            evicted = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone());
            if let Some(k) = &evicted {
                self.entries.remove(k);
                self.evictions += 1;
            }
        }
        self.entries.insert(key, CacheEntry::new(handle));
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.value.memory_bytes() as u64)
            .sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LoadedTable;
    use polars::prelude::*;

    fn handle(name: &str) -> Arc<dyn TableHandle> {
        Arc::new(LoadedTable::new(name, df!("a" => [1i64, 2, 3]).unwrap()))
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = SourceCache::new(2);
        cache.insert("a".into(), handle("a"));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b".into(), handle("b"));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("a").is_some());

        let evicted = cache.insert("c".into(), handle("c"));
        assert_eq!(evicted.as_deref(), Some("b"));
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_hit_and_miss_counts() {
        let mut cache = SourceCache::new(4);
        assert!(cache.get("x").is_none());
        cache.insert("x".into(), handle("x"));
        assert!(cache.get("x").is_some());
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert!(cache.memory_bytes() > 0);
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }
}
