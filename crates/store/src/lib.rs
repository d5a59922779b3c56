//! Deduplication store: the latest pending [`ResultBatch`] per [`CompositeKey`].
//!
//! Writes are last-write-wins with no merging. Every write is tagged with a
//! process-wide [`Generation`] so a worker can clear an entry only if nobody
//! replaced it while the worker was busy with it.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use polrep_core::{CompositeKey, ResultBatch};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Monotonic write stamp; strictly increases across all keys.
pub type Generation = u64;

pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug)]
struct Entry {
    batch: ResultBatch,
    generation: Generation,
}

type Shard = FxHashMap<CompositeKey, Entry>;

/// Concurrent key -> batch map, sharded by key fingerprint.
#[derive(Debug)]
pub struct DedupStore {
    shards: Vec<Mutex<Shard>>,
    next_generation: AtomicU64,
}

impl Default for DedupStore {
    fn default() -> Self { Self::with_shards(DEFAULT_SHARDS) }
}

impl DedupStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_shards(shards: usize) -> Self {
        let n = shards.max(1);
        Self {
            shards: (0..n).map(|_| Mutex::new(FxHashMap::default())).collect(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn shard_count(&self) -> usize { self.shards.len() }

    fn shard(&self, key: &CompositeKey) -> MutexGuard<'_, Shard> {
        let idx = (key.fingerprint() % self.shards.len() as u64) as usize;
        // A panic while holding a shard lock cannot leave an entry half-written.
        self.shards[idx].lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Unconditionally store `batch` under `key`, replacing any previous batch.
    pub fn put(&self, key: CompositeKey, batch: ResultBatch) -> Generation {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut shard = self.shard(&key);
        if shard.insert(key, Entry { batch, generation }).is_some() {
            trace!(generation, "store entry superseded");
        }
        generation
    }

    /// Current batch and its write stamp, if present.
    pub fn get(&self, key: &CompositeKey) -> Option<(ResultBatch, Generation)> {
        self.shard(key).get(key).map(|e| (e.batch.clone(), e.generation))
    }

    pub fn contains(&self, key: &CompositeKey) -> bool {
        self.shard(key).contains_key(key)
    }

    /// Remove `key`; a no-op when absent.
    pub fn delete(&self, key: &CompositeKey) {
        self.shard(key).remove(key);
    }

    /// Remove `key` only if it still holds the write stamped `generation`.
    /// Returns whether an entry was removed.
    pub fn delete_if(&self, key: &CompositeKey, generation: Generation) -> bool {
        let mut shard = self.shard(key);
        match shard.get(key) {
            Some(e) if e.generation == generation => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len()).sum()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
