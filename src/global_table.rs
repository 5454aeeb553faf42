//! Globally shared, growable, RCU-protected hash table.
//!
//! ```text
//! RcuProtected<Table> ── mask
//!                     └─ buckets: [RcuProtected<Bucket>; mask + 1]
//!                                      └─ entries: [(K, V)]
//! ```
//!
//! A lookup is two nested reads: one on the table to pick the bucket and
//! one on the bucket to scan it. A store is a write on one bucket: the
//! bucket is copied with the new entry and republished, never mutated in
//! place. When a bucket grows past [`MAX_BUCKET_SIZE`] the store files a
//! grow request, and the next store doubles the bucket count.
//!
//! # Consistency
//!
//! Stores and growth are serialized by a gate, so growth never loses a
//! store. Growth takes the gate upgradeable first, which turns away new
//! stores while it waits for the current ones to drain, so constant store
//! traffic cannot starve it. Lookups take no lock and are not linearizable with growth: a
//! lookup still walking the old table can miss a key that was stored into
//! the new table while it was being published. Lookups that start after a
//! store has returned always see it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hash::{Hash, Hasher};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::RwLock;

use crate::cpu_table::{StorePolicy, StoreState};
use crate::hash::Murmur3Hasher;
use crate::rcu::{RcuProtected, RcuWriter, WriteRef};

/// Entries a bucket may hold before the table asks to grow.
pub const MAX_BUCKET_SIZE: usize = 4;

/// Bucket count of a default table.
pub const DEFAULT_BUCKETS: usize = 16;

struct Bucket<K, V> {
    entries: Vec<(K, V)>,
}

impl<K: Eq, V> Bucket<K, V> {
    fn position(&self, key: &K) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }
}

struct Table<K, V> {
    mask: usize,
    buckets: Box<[RcuProtected<Bucket<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn with_buckets(count: usize) -> Self {
        Self::from_buckets((0..count).map(|_| Vec::new()).collect())
    }

    fn from_buckets(buckets: Vec<Vec<(K, V)>>) -> Self {
        let mask = buckets.len() - 1;
        let buckets: Vec<_> = buckets
            .into_iter()
            .map(|entries| RcuProtected::new(Bucket { entries }))
            .collect();
        Self {
            mask,
            buckets: buckets.into_boxed_slice(),
        }
    }

    fn bucket(&self, hash: usize) -> &RcuProtected<Bucket<K, V>> {
        &self.buckets[hash & self.mask]
    }
}

fn hash_of<K: Hash>(key: &K) -> usize {
    let mut hasher = Murmur3Hasher::default();
    key.hash(&mut hasher);
    hasher.finish() as usize
}

/// Copies a bucket with one entry added or replaced.
struct BucketStore<K, V> {
    key: Option<K>,
    value: Option<V>,
    policy: StorePolicy,
    state: StoreState,
    existing: Option<V>,
    new_len: usize,
}

impl<K: Eq + Clone, V: Clone> RcuWriter<Bucket<K, V>> for BucketStore<K, V> {
    fn while_readers_exist(&mut self, write: &mut WriteRef<'_, Bucket<K, V>>) {
        let (Some(key), Some(value)) = (self.key.take(), self.value.take()) else {
            return;
        };
        let current = write.current();
        let mut entries = current.entries.clone();
        match current.position(&key) {
            Some(pos) if self.policy == StorePolicy::KeepPrevious => {
                self.existing = Some(current.entries[pos].1.clone());
                self.state = StoreState::Skipped;
                self.new_len = entries.len();
                return;
            }
            Some(pos) => {
                entries[pos].1 = value;
                self.state = StoreState::StoredOverwrite;
            }
            None => {
                entries.push((key, value));
                self.state = StoreState::StoredNew;
            }
        }
        self.new_len = entries.len();
        write.publish(Box::new(Bucket { entries }));
    }
}

/// Rebuilds the table with twice the buckets.
struct TableGrow<'a> {
    grow_requests: &'a AtomicUsize,
    new_count: usize,
}

impl<K: Hash + Clone, V: Clone> RcuWriter<Table<K, V>> for TableGrow<'_> {
    fn while_readers_exist(&mut self, write: &mut WriteRef<'_, Table<K, V>>) {
        if self.grow_requests.swap(0, Ordering::AcqRel) == 0 {
            // Someone else already grew the table.
            return;
        }
        let old = write.current();
        let new_count = old.buckets.len() * 2;
        let mask = new_count - 1;
        let mut buckets: Vec<Vec<(K, V)>> = (0..new_count).map(|_| Vec::new()).collect();
        for bucket in old.buckets.iter() {
            bucket.read(|bucket| {
                for (key, value) in &bucket.entries {
                    buckets[hash_of(key) & mask].push((key.clone(), value.clone()));
                }
            });
        }
        self.new_count = new_count;
        write.publish(Box::new(Table::from_buckets(buckets)));
    }
}

/// Concurrent `K -> V` map with lock-free lookups.
pub struct GlobalTable<K, V> {
    table: RcuProtected<Table<K, V>>,
    grow_requests: AtomicUsize,
    /// Stores hold it shared, growth upgrades to exclusive.
    grow_gate: RwLock<()>,
    len: AtomicUsize,
}

impl<K, V> GlobalTable<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Table with `count` buckets, rounded up to a power of two.
    pub fn with_buckets(count: usize) -> Self {
        Self {
            table: RcuProtected::new(Table::with_buckets(count.max(1).next_power_of_two())),
            grow_requests: AtomicUsize::new(0),
            grow_gate: RwLock::new(()),
            len: AtomicUsize::new(0),
        }
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.table.read(|table| table.mask + 1)
    }

    /// Pending grow requests.
    pub fn grow_requests(&self) -> usize {
        self.grow_requests.load(Ordering::Relaxed)
    }

    /// Look up `key`.
    pub fn load(&self, key: &K) -> Option<V> {
        let hash = hash_of(key);
        self.table.read(|table| {
            table.bucket(hash).read(|bucket| {
                bucket
                    .entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            })
        })
    }

    /// Insert or update `key`.
    pub fn store(&self, key: K, value: V, policy: StorePolicy) -> StoreState {
        self.store_inner(key, value, policy).0
    }

    /// Insert `value` unless `key` is present. Returns the value now
    /// mapped to `key` and whether it is the one passed in.
    pub fn get_or_insert(&self, key: K, value: V) -> (V, bool) {
        let (state, existing) = self.store_inner(key, value.clone(), StorePolicy::KeepPrevious);
        match (state, existing) {
            (StoreState::Skipped, Some(existing)) => (existing, false),
            _ => (value, true),
        }
    }

    fn store_inner(&self, key: K, value: V, policy: StorePolicy) -> (StoreState, Option<V>) {
        if self.grow_requests.load(Ordering::Acquire) > 0 {
            self.grow();
        }

        let _gate = self.grow_gate.read();
        let hash = hash_of(&key);
        let mut writer = BucketStore {
            key: Some(key),
            value: Some(value),
            policy,
            state: StoreState::Skipped,
            existing: None,
            new_len: 0,
        };
        self.table.read(|table| table.bucket(hash).write(&mut writer));

        if writer.state == StoreState::StoredNew {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        if writer.new_len > MAX_BUCKET_SIZE {
            self.grow_requests.fetch_add(1, Ordering::AcqRel);
        }
        (writer.state, writer.existing)
    }

    /// Double the bucket count if a grow was requested.
    fn grow(&self) {
        let _gate = self.grow_gate.upgradeable_read().upgrade();
        let mut grower = TableGrow {
            grow_requests: &self.grow_requests,
            new_count: 0,
        };
        self.table.write(&mut grower);
        if grower.new_count != 0 {
            debug!("global_table: grew to {} buckets", grower.new_count);
        }
    }

    /// Ask the next store to grow the table.
    pub fn request_grow(&self) {
        self.grow_requests.fetch_add(1, Ordering::AcqRel);
    }
}

impl<K, V> Default for GlobalTable<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}
