use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;

struct BucketInner<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

struct Bucket<K, V> {
    inner: Mutex<BucketInner<K, V>>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32, items: Vec<(K, V)>) -> Self {
        Self {
            inner: Mutex::new(BucketInner { local_depth, items }),
        }
    }
}

struct Directory<K, V> {
    global_depth: u32,
    buckets: Vec<Arc<Bucket<K, V>>>,
    num_buckets: usize,
}

/// Concurrent extendible hash table. The directory is a vector of
/// `2^global_depth` bucket references; splitting a full bucket bumps its
/// local depth, doubles the directory when the local depth exceeds the
/// global one, and redistributes entries by the new top hash bit. Shrink
/// and merge are not supported.
///
/// The hasher is pluggable so tests can pin a deterministic hash; the
/// default is `RandomState`.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    directory: Mutex<Directory<K, V>>,
    bucket_capacity: usize,
    hasher: S,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Eq + Hash + Copy,
    V: Copy,
{
    pub fn new(bucket_capacity: usize) -> Self {
        Self::with_hasher(bucket_capacity, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Eq + Hash + Copy,
    V: Copy,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_capacity: usize, hasher: S) -> Self {
        assert!(bucket_capacity > 0);
        Self {
            directory: Mutex::new(Directory {
                global_depth: 0,
                buckets: vec![Arc::new(Bucket::new(0, Vec::new()))],
                num_buckets: 1,
            }),
            bucket_capacity,
            hasher,
        }
    }

    fn hash_key(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn dir_index(hash: u64, global_depth: u32) -> usize {
        (hash & ((1u64 << global_depth) - 1)) as usize
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let bucket = {
            let dir = self.directory.lock();
            let idx = Self::dir_index(self.hash_key(key), dir.global_depth);
            if idx >= dir.buckets.len() {
                return None;
            }
            Arc::clone(&dir.buckets[idx])
        };
        let inner = bucket.inner.lock();
        inner.items.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn remove(&self, key: &K) -> bool {
        let bucket = {
            let dir = self.directory.lock();
            let idx = Self::dir_index(self.hash_key(key), dir.global_depth);
            if idx >= dir.buckets.len() {
                return false;
            }
            Arc::clone(&dir.buckets[idx])
        };
        let mut inner = bucket.inner.lock();
        match inner.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                inner.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Insert or update. The directory lock is held across the structural
    /// part so splits are serialized.
    pub fn insert(&self, key: K, value: V) {
        let mut dir = self.directory.lock();
        loop {
            let idx = Self::dir_index(self.hash_key(&key), dir.global_depth);
            let bucket = Arc::clone(&dir.buckets[idx]);
            let mut inner = bucket.inner.lock();

            if let Some(slot) = inner.items.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value;
                return;
            }
            if inner.items.len() < self.bucket_capacity {
                inner.items.push((key, value));
                return;
            }

            // Bucket full: split it, then retry the insert against the
            // refreshed directory. A skewed bucket may need several rounds.
            inner.local_depth += 1;
            if inner.local_depth > dir.global_depth {
                let copy = dir.buckets.clone();
                dir.buckets.extend(copy);
                dir.global_depth += 1;
            }

            let mask = 1u64 << (inner.local_depth - 1);
            let mut kept = Vec::with_capacity(inner.items.len());
            let mut moved = Vec::new();
            for (k, v) in inner.items.drain(..) {
                if self.hash_key(&k) & mask != 0 {
                    moved.push((k, v));
                } else {
                    kept.push((k, v));
                }
            }
            inner.items = kept;
            let new_bucket = Arc::new(Bucket::new(inner.local_depth, moved));
            drop(inner);

            dir.num_buckets += 1;
            for (i, slot) in dir.buckets.iter_mut().enumerate() {
                if Arc::ptr_eq(slot, &bucket) && (i as u64) & mask != 0 {
                    *slot = Arc::clone(&new_bucket);
                }
            }
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.directory.lock().global_depth
    }

    pub fn local_depth(&self, bucket_idx: usize) -> Option<u32> {
        let bucket = {
            let dir = self.directory.lock();
            if bucket_idx >= dir.buckets.len() {
                return None;
            }
            Arc::clone(&dir.buckets[bucket_idx])
        };
        let depth = bucket.inner.lock().local_depth;
        Some(depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.directory.lock().num_buckets
    }

    #[cfg(test)]
    fn buckets_shared(&self, i: usize, j: usize) -> bool {
        let dir = self.directory.lock();
        Arc::ptr_eq(&dir.buckets[i], &dir.buckets[j])
    }
}
