//! CPU-private open-addressing hash table.
//!
//! Maps one raw address to another, e.g. a native code address to its
//! translation in the code cache. Each CPU owns one instance and nothing
//! synchronizes it, so lookups cost a hash and a short linear scan.
//!
//! `find` gives up after [`MAX_SCAN`] probes even if the key sits further
//! along; callers treat the table as a cache, not as the source of truth.
//! An insertion that has to probe past the bound doubles the table.

use alloc::vec;
use alloc::vec::Vec;

use crate::hash::fmix64;

/// Probes before a lookup gives up and an insertion forces a resize.
pub const MAX_SCAN: usize = 8;

/// Size of the first allocation.
pub const MIN_DEFAULT_ENTRIES: usize = 1024;

/// What to do when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    #[default]
    OverwritePrevious,
    KeepPrevious,
}

/// Outcome of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    StoredNew,
    StoredOverwrite,
    Skipped,
}

impl StoreState {
    /// True if the table now maps the key to the stored value.
    pub fn stored(self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

/// One slot; empty iff `source == 0`.
#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    source: u64,
    dest: u64,
}

/// Open-addressing `u64 -> u64` table with linear probing.
#[derive(Debug)]
pub struct CpuPrivateTable {
    entries: Vec<Entry>,
    initial_entries: usize,
    len: usize,
}

impl Default for CpuPrivateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuPrivateTable {
    pub const fn new() -> Self {
        Self::with_initial_entries(MIN_DEFAULT_ENTRIES)
    }

    /// Table whose first allocation holds `entries` slots (rounded up to a
    /// power of two). Nothing is allocated until the first store.
    pub const fn with_initial_entries(entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            initial_entries: entries.next_power_of_two(),
            len: 0,
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    /// Look up `key`. Null keys are never present.
    pub fn find(&self, key: u64) -> Option<u64> {
        if self.entries.is_empty() || key == 0 {
            return None;
        }
        let mask = self.mask();
        let mut index = fmix64(key) as usize;
        for _ in 0..MAX_SCAN {
            index &= mask;
            let entry = &self.entries[index];
            if entry.source == 0 {
                break;
            }
            if entry.source == key {
                return Some(entry.dest);
            }
            index += 1;
        }
        None
    }

    /// Like [`find`](Self::find) but writes into `value`; returns whether
    /// the key was found.
    pub fn load(&self, key: u64, value: &mut u64) -> bool {
        match self.find(key) {
            Some(found) => {
                *value = found;
                true
            }
            None => false,
        }
    }

    /// Insert or update `key`.
    pub fn store(&mut self, key: u64, value: u64, policy: StorePolicy) -> StoreState {
        if key == 0 {
            return StoreState::Skipped;
        }
        if self.entries.is_empty() {
            self.entries = vec![Entry::default(); self.initial_entries.max(MAX_SCAN)];
        }
        let (state, scanned) = self.insert(key, value, policy);
        if state == StoreState::StoredNew {
            self.len += 1;
        }
        if scanned >= MAX_SCAN {
            self.grow();
        }
        state
    }

    /// Probe for `key` and write it. Returns the outcome and probe count.
    fn insert(&mut self, key: u64, value: u64, policy: StorePolicy) -> (StoreState, usize) {
        // A full table has no empty slot to stop the probe.
        if self.len + 1 >= self.entries.len() {
            self.grow();
        }
        let mask = self.mask();
        let mut index = fmix64(key) as usize;
        let mut scanned = 0;
        loop {
            index &= mask;
            let entry = &mut self.entries[index];
            if entry.source == 0 {
                entry.source = key;
                entry.dest = value;
                return (StoreState::StoredNew, scanned);
            }
            if entry.source == key {
                return match policy {
                    StorePolicy::OverwritePrevious => {
                        entry.dest = value;
                        (StoreState::StoredOverwrite, scanned)
                    }
                    StorePolicy::KeepPrevious => (StoreState::Skipped, scanned),
                };
            }
            scanned += 1;
            index += 1;
        }
    }

    /// Double the table and rehash every live entry, repeating until no
    /// entry lands past the scan bound.
    fn grow(&mut self) {
        let mut new_size = self.entries.len() * 2;
        'retry: loop {
            let mut entries = vec![Entry::default(); new_size];
            let mask = new_size - 1;
            for old in self.entries.iter().filter(|e| e.source != 0) {
                let mut index = fmix64(old.source) as usize;
                let mut scanned = 0;
                loop {
                    index &= mask;
                    if entries[index].source == 0 {
                        entries[index] = *old;
                        break;
                    }
                    scanned += 1;
                    index += 1;
                }
                if scanned >= MAX_SCAN {
                    new_size *= 2;
                    continue 'retry;
                }
            }
            trace!("cpu_table: grew {} -> {} slots", self.entries.len(), new_size);
            self.entries = entries;
            return;
        }
    }
}
