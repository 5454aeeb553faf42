//! Owned per-CPU slots.
//!
//! Free lists, code-cache tables and execution state are all private to
//! one CPU. Each slot is normally wrapped in a `spin::Mutex`; the lock is
//! only ever taken by the CPU that owns the slot, so it plays the role of
//! the preemption-disabled section around CPU-private state.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::platform;

/// A fixed array of per-CPU values.
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Create `num_cpus` slots, building each one with `init(cpu)`.
    pub fn new(num_cpus: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let num_cpus = num_cpus.max(1);
        let slots: Vec<T> = (0..num_cpus).map(&mut init).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of CPU slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index for `cpu`. CPUs beyond the array share slots modulo its
    /// length.
    #[inline]
    pub fn slot_of(&self, cpu: u32) -> usize {
        cpu as usize % self.slots.len()
    }

    /// The slot of the CPU we are running on.
    #[inline]
    pub fn current(&self) -> &T {
        self.get(platform::cpu_id())
    }

    #[inline]
    pub fn get(&self, cpu: u32) -> &T {
        &self.slots[self.slot_of(cpu)]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
