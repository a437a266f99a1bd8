// Copyright 2020 Joyent, Inc.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

type BlockKey = (u32, u64);

struct Entry {
    block: Bytes,
    ref_count: u32,
    /// Position in the LRU order; larger is more recent.
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockCacheStats {
    pub max_memory: u64,
    pub limit: u64,
    pub available: u64,
    pub accesses: u64,
    pub hits: u64,
}

struct Inner {
    entries: HashMap<BlockKey, Entry>,
    lru: BTreeMap<u64, BlockKey>,
    next_seq: u64,
    min_memory: u64,
    max_memory: u64,
    limit: u64,
    available: u64,
    accesses: u64,
    hits: u64,
}

impl Inner {
    fn touch(&mut self, key: BlockKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            self.lru.remove(&entry.seq);
            entry.seq = seq;
            self.lru.insert(seq, key);
        }
    }

    /// Evicts unreferenced blocks, oldest first, until `amount` bytes are
    /// available.  Returns the number of bytes freed.
    fn make_room(&mut self, amount: u64) -> u64 {
        let mut freed = 0;
        let candidates: Vec<(u64, BlockKey)> =
            self.lru.iter().map(|(seq, key)| (*seq, *key)).collect();
        for (seq, key) in candidates {
            if self.available >= amount {
                break;
            }
            let evictable = self
                .entries
                .get(&key)
                .map(|e| e.ref_count == 0)
                .unwrap_or(false);
            if !evictable {
                continue;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.lru.remove(&seq);
                let len = entry.block.len() as u64;
                self.available += len;
                freed += len;
            }
        }
        freed
    }
}

/// Memory-bounded LRU cache of file blocks keyed by (file id, offset).
///
/// Readers `checkout` a block and must `checkin` it when done; a checked-out
/// block is never evicted.  The limit can grow up to `max_memory` and shrink
/// down to `min_memory` at runtime.
pub struct FileBlockCache {
    inner: Mutex<Inner>,
    next_file_id: AtomicU32,
}

impl FileBlockCache {
    pub fn new(min_memory: u64, max_memory: u64, limit: u64) -> FileBlockCache {
        let limit = limit.max(min_memory).min(max_memory);
        FileBlockCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                next_seq: 0,
                min_memory,
                max_memory,
                limit,
                available: limit,
                accesses: 0,
                hits: 0,
            }),
            next_file_id: AtomicU32::new(0),
        }
    }

    /// Allocates an id for a newly opened file.
    pub fn get_next_file_id(&self) -> u32 {
        self.next_file_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn checkout(&self, file_id: u32, offset: u64) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.accesses += 1;
        let key = (file_id, offset);
        let block = match inner.entries.get_mut(&key) {
            Some(entry) => {
                entry.ref_count += 1;
                entry.block.clone()
            }
            None => return None,
        };
        inner.touch(key);
        inner.hits += 1;
        Some(block)
    }

    pub fn checkin(&self, file_id: u32, offset: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&(file_id, offset)) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Adds a block.  Returns false if it is already cached or cannot fit even
    /// after evicting and growing the limit to `max_memory`.
    pub fn insert(&self, file_id: u32, offset: u64, block: Bytes, checkout: bool) -> bool {
        let mut inner = self.inner.lock();
        let key = (file_id, offset);
        if inner.entries.contains_key(&key) {
            return false;
        }
        let length = block.len() as u64;
        if inner.available < length {
            inner.make_room(length);
        }
        if inner.available < length {
            let shortfall = length - inner.available;
            if shortfall <= inner.max_memory - inner.limit {
                inner.limit += shortfall;
                inner.available += shortfall;
            } else {
                return false;
            }
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key,
            Entry {
                block,
                ref_count: if checkout { 1 } else { 0 },
                seq,
            },
        );
        inner.lru.insert(seq, key);
        inner.available -= length;
        true
    }

    pub fn contains(&self, file_id: u32, offset: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.accesses += 1;
        if inner.entries.contains_key(&(file_id, offset)) {
            inner.hits += 1;
            true
        } else {
            false
        }
    }

    pub fn increase_limit(&self, amount: u64) {
        let mut inner = self.inner.lock();
        let amount = amount.min(inner.max_memory - inner.limit);
        inner.limit += amount;
        inner.available += amount;
    }

    /// Shrinks the limit by up to `amount`, never below `min_memory`.
    /// Returns the number of bytes evicted to do so.
    pub fn decrease_limit(&self, amount: u64) -> u64 {
        let mut inner = self.inner.lock();
        let mut amount = amount;
        let mut freed = 0;
        if inner.available < amount {
            amount = amount.min(inner.limit - inner.min_memory);
            freed = inner.make_room(amount);
            amount = amount.min(inner.available);
        }
        inner.available -= amount;
        inner.limit -= amount;
        freed
    }

    pub fn make_room(&self, amount: u64) -> u64 {
        self.inner.lock().make_room(amount)
    }

    pub fn get_stats(&self) -> BlockCacheStats {
        let inner = self.inner.lock();
        BlockCacheStats {
            max_memory: inner.max_memory,
            limit: inner.limit,
            available: inner.available,
            accesses: inner.accesses,
            hits: inner.hits,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(len: usize) -> Bytes {
        Bytes::from(vec![0xab; len])
    }

    #[test]
    fn checked_out_blocks_survive_eviction() {
        let cache = FileBlockCache::new(100, 100, 100);
        assert!(cache.insert(1, 0, block(40), true));
        assert!(cache.insert(1, 40, block(40), false));
        assert!(!cache.insert(1, 40, block(40), false));

        assert!(cache.insert(1, 80, block(40), false));
        assert!(cache.contains(1, 0));
        assert!(!cache.contains(1, 40));

        assert!(!cache.insert(2, 0, block(80), false));
        cache.checkin(1, 0);
        assert!(cache.insert(2, 0, block(80), false));
        assert!(!cache.contains(1, 0));
    }

    #[test]
    fn eviction_is_least_recently_used() {
        let cache = FileBlockCache::new(0, 30, 30);
        cache.insert(1, 0, block(10), false);
        cache.insert(1, 10, block(10), false);
        cache.insert(1, 20, block(10), false);
        let b = cache.checkout(1, 0).unwrap();
        assert_eq!(b.len(), 10);
        cache.checkin(1, 0);
        cache.insert(1, 30, block(10), false);
        assert!(cache.contains(1, 0));
        assert!(!cache.contains(1, 10));
    }

    #[test]
    fn limits_respect_bounds() {
        let cache = FileBlockCache::new(20, 100, 50);
        cache.increase_limit(500);
        assert_eq!(cache.get_stats().limit, 100);
        cache.insert(1, 0, block(60), false);
        assert_eq!(cache.decrease_limit(90), 60);
        let stats = cache.get_stats();
        assert_eq!(stats.limit, 20);
        assert_eq!(stats.available, 20);
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_count_hits() {
        let cache = FileBlockCache::new(0, 100, 100);
        cache.insert(3, 0, block(10), false);
        assert!(cache.checkout(3, 0).is_some());
        assert!(cache.checkout(3, 99).is_none());
        let stats = cache.get_stats();
        assert_eq!(stats.accesses, 2);
        assert_eq!(stats.hits, 1);
    }
}
