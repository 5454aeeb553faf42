//! Watchpoint descriptors and their allocator.
//!
//! A descriptor is the out-of-line metadata for one watched object. Indices
//! come from two places:
//!
//! 1. The current CPU's free list, a singly-linked stack threaded through
//!    the free slots themselves.
//! 2. A shared bump index that only ever grows, up to a hard ceiling.
//!
//! Slots are a tagged sum ([`Slot`]): a free slot holds only its free-list
//! link, so a stale index can never be read back as live metadata.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::percpu::PerCpu;
use crate::platform;
use crate::tag::MAX_INDEX_COUNT;

/// Error types for descriptor operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Null pointers cannot be watched.
    NullPointer,
    /// Every index up to the ceiling is in use.
    Exhausted,
    /// Pointer carries no descriptor index.
    NotTagged(u64),
    /// Address bits 48..=63 do not replicate bit 47.
    NotCanonical(u64),
    /// Index was never handed out.
    InvalidIndex(u32),
    /// Index is not active (already freed).
    DoubleFree(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NullPointer => write!(f, "Cannot watch a null pointer"),
            Self::Exhausted => write!(f, "Descriptor index space exhausted"),
            Self::NotTagged(p) => write!(f, "Pointer {:#x} is not tagged", p),
            Self::NotCanonical(p) => write!(f, "Pointer {:#x} is not canonical", p),
            Self::InvalidIndex(i) => write!(f, "Invalid descriptor index {}", i),
            Self::DoubleFree(i) => write!(f, "Descriptor {} freed twice", i),
        }
    }
}

impl core::error::Error for Error {}

impl From<Error> for axerrno::AxError {
    fn from(err: Error) -> Self {
        match err {
            Error::Exhausted => axerrno::AxError::NoMemory,
            Error::DoubleFree(_) => axerrno::AxError::BadState,
            Error::NullPointer
            | Error::NotTagged(_)
            | Error::NotCanonical(_)
            | Error::InvalidIndex(_) => axerrno::AxError::InvalidInput,
        }
    }
}

// =============================================================================
// Descriptor State
// =============================================================================

/// Lifecycle and provenance bits of a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorState(u8);

impl DescriptorState {
    /// The allocation site told us the object's type.
    pub const TYPE_IS_KNOWN: Self = Self(1 << 0);
    /// The object has been released.
    pub const WAS_FREED: Self = Self(1 << 1);
    /// The release came from application code.
    pub const WAS_FREED_BY_APP: Self = Self(1 << 2);
    /// The pointer was passed into host code.
    pub const CROSSED_HOST_BOUNDARY: Self = Self(1 << 3);
    /// The pointer was passed back into application code.
    pub const CROSSED_APP_BOUNDARY: Self = Self(1 << 4);
    /// Allocated by application code rather than by the host.
    pub const WAS_ALLOCATED_BY_APP: Self = Self(1 << 5);
    /// The slot is live. Checked before any free-list mutation.
    pub const IS_ACTIVE: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set_state(&mut self, bits: Self) {
        self.0 |= bits.0;
    }

    pub fn unset_state(&mut self, bits: Self) {
        self.0 &= !bits.0;
    }
}

impl core::ops::BitOr for DescriptorState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Metadata for one watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Untagged base address of the object.
    pub base_address: u64,
    /// Object size in bytes.
    pub size: usize,
    /// Who allocated it, e.g. the return address of the allocation site.
    pub owner: u64,
    pub state: DescriptorState,
}

impl Descriptor {
    pub const fn new(base_address: u64, size: usize, owner: u64) -> Self {
        Self {
            base_address,
            size,
            owner,
            state: DescriptorState::IS_ACTIVE,
        }
    }

    pub const fn is_active(&self) -> bool {
        self.state.contains(DescriptorState::IS_ACTIVE)
    }

    /// True if `addr` falls inside the tracked object.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr - self.base_address < self.size as u64
    }
}

/// Contents of one descriptor-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Bump-allocated but not yet initialized.
    Unused,
    Active(Descriptor),
    /// On a CPU free list. `next_free` links to the next free index.
    Free { next_free: Option<u32> },
}

// =============================================================================
// Allocator
// =============================================================================

type Chunk = Box<[Mutex<Slot>]>;

/// Bump allocator plus per-CPU free lists over a lazily grown slab.
pub struct DescriptorAllocator {
    /// Next never-used index.
    next_index: AtomicUsize,
    /// Hard ceiling on indices.
    limit: usize,
    chunk_size: usize,
    chunks: Box<[Once<Chunk>]>,
    /// Head of each CPU's free list.
    free_lists: PerCpu<Mutex<Option<u32>>>,
    active: AtomicUsize,
    exhausted_reported: AtomicBool,
}

impl DescriptorAllocator {
    /// Create an allocator for up to `limit` descriptors.
    ///
    /// `limit` is clamped to what a tagged pointer can encode.
    pub fn new(limit: usize, chunk_size: usize, num_cpus: usize) -> Self {
        let limit = limit.min(MAX_INDEX_COUNT);
        let chunk_size = chunk_size.max(1);
        let num_chunks = limit.div_ceil(chunk_size);
        let chunks: Vec<Once<Chunk>> = (0..num_chunks).map(|_| Once::new()).collect();

        Self {
            next_index: AtomicUsize::new(0),
            limit,
            chunk_size,
            chunks: chunks.into_boxed_slice(),
            free_lists: PerCpu::new(num_cpus, |_| Mutex::new(None)),
            active: AtomicUsize::new(0),
            exhausted_reported: AtomicBool::new(false),
        }
    }

    /// Maximum number of descriptors.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of currently active descriptors.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Number of indices ever handed out by the bump allocator.
    pub fn high_water(&self) -> usize {
        self.next_index.load(Ordering::Acquire).min(self.limit)
    }

    fn slot(&self, index: u32) -> Result<&Mutex<Slot>, Error> {
        let index = index as usize;
        if index >= self.high_water() {
            return Err(Error::InvalidIndex(index as u32));
        }
        let chunk = self.chunks[index / self.chunk_size]
            .get()
            .ok_or(Error::InvalidIndex(index as u32))?;
        Ok(&chunk[index % self.chunk_size])
    }

    fn bump(&self) -> Result<u32, Error> {
        let mut current = self.next_index.load(Ordering::Relaxed);
        loop {
            if current >= self.limit {
                if !self.exhausted_reported.swap(true, Ordering::Relaxed) {
                    warn!("descriptor: all {} indices in use, watching stops", self.limit);
                }
                return Err(Error::Exhausted);
            }
            // The chunk must exist before the index becomes visible.
            let chunk_size = self.chunk_size;
            self.chunks[current / chunk_size]
                .call_once(|| (0..chunk_size).map(|_| Mutex::new(Slot::Unused)).collect());
            match self.next_index.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(current as u32),
                Err(x) => current = x,
            }
        }
    }

    fn pop_free(&self, cpu: u32) -> Option<u32> {
        let mut head = self.free_lists.get(cpu).lock();
        let index = (*head)?;
        let slot = self.slot(index).ok()?;
        let next = match *slot.lock() {
            Slot::Free { next_free } => next_free,
            other => {
                error!("descriptor: free list of cpu {} points at {:?}", cpu, other);
                *head = None;
                return None;
            }
        };
        *head = next;
        Some(index)
    }

    /// Allocate a descriptor on the current CPU.
    pub fn allocate(&self, desc: Descriptor) -> Result<u32, Error> {
        self.allocate_on(platform::cpu_id(), desc)
    }

    /// Allocate a descriptor, preferring `cpu`'s free list.
    ///
    /// The descriptor is fully written before the index is returned.
    pub fn allocate_on(&self, cpu: u32, mut desc: Descriptor) -> Result<u32, Error> {
        let index = match self.pop_free(cpu) {
            Some(index) => index,
            None => self.bump()?,
        };
        desc.state.set_state(DescriptorState::IS_ACTIVE);
        desc.state.unset_state(DescriptorState::WAS_FREED);
        *self.slot(index)?.lock() = Slot::Active(desc);
        self.active.fetch_add(1, Ordering::Relaxed);
        trace!("descriptor: allocated #{} for {:#x}+{}", index, desc.base_address, desc.size);
        Ok(index)
    }

    /// Free a descriptor onto the current CPU's free list.
    pub fn free(&self, index: u32) -> Result<Descriptor, Error> {
        self.free_on(platform::cpu_id(), index)
    }

    /// Free a descriptor onto `cpu`'s free list.
    ///
    /// Returns the retired descriptor with `WAS_FREED` set so the caller
    /// can clear any shadow state for the object.
    pub fn free_on(&self, cpu: u32, index: u32) -> Result<Descriptor, Error> {
        let slot = self.slot(index)?;
        let mut head = self.free_lists.get(cpu).lock();
        let mut slot = slot.lock();
        let mut retired = match *slot {
            Slot::Active(desc) if desc.is_active() => desc,
            _ => {
                error!("descriptor: double free of #{}", index);
                return Err(Error::DoubleFree(index));
            }
        };
        retired.state.unset_state(DescriptorState::IS_ACTIVE);
        retired.state.set_state(DescriptorState::WAS_FREED);
        *slot = Slot::Free { next_free: *head };
        *head = Some(index);
        self.active.fetch_sub(1, Ordering::Relaxed);
        Ok(retired)
    }

    /// Give back the most recently bump-allocated descriptor.
    ///
    /// If `index` is still the top of the bump allocator the index is
    /// simply un-bumped; otherwise this is a normal [`free`](Self::free).
    pub fn reclaim_last(&self, index: u32) -> Result<Descriptor, Error> {
        let slot = self.slot(index)?;
        let mut guard = slot.lock();
        let desc = match *guard {
            Slot::Active(desc) if desc.is_active() => desc,
            _ => return Err(Error::DoubleFree(index)),
        };
        let top = index as usize + 1;
        if self
            .next_index
            .compare_exchange(top, index as usize, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            *guard = Slot::Unused;
            self.active.fetch_sub(1, Ordering::Relaxed);
            let mut retired = desc;
            retired.state.unset_state(DescriptorState::IS_ACTIVE);
            retired.state.set_state(DescriptorState::WAS_FREED);
            return Ok(retired);
        }
        drop(guard);
        self.free(index)
    }

    /// Copy of the descriptor at `index`, if it is active.
    pub fn get(&self, index: u32) -> Option<Descriptor> {
        match *self.slot(index).ok()?.lock() {
            Slot::Active(desc) => Some(desc),
            _ => None,
        }
    }

    /// Raw slot contents at `index`.
    pub fn slot_state(&self, index: u32) -> Result<Slot, Error> {
        Ok(*self.slot(index)?.lock())
    }

    /// Mutate an active descriptor in place.
    pub fn update<R>(&self, index: u32, f: impl FnOnce(&mut Descriptor) -> R) -> Result<R, Error> {
        let mut slot = self.slot(index)?.lock();
        match &mut *slot {
            Slot::Active(desc) => Ok(f(desc)),
            _ => Err(Error::InvalidIndex(index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(base: u64) -> Descriptor {
        Descriptor::new(base, 64, 0xdead)
    }

    #[test]
    fn test_state_bits() {
        let mut state = DescriptorState::IS_ACTIVE | DescriptorState::TYPE_IS_KNOWN;
        assert!(state.contains(DescriptorState::IS_ACTIVE));
        state.unset_state(DescriptorState::IS_ACTIVE);
        assert!(!state.contains(DescriptorState::IS_ACTIVE));
        assert!(state.contains(DescriptorState::TYPE_IS_KNOWN));
    }

    #[test]
    fn test_descriptor_contains() {
        let d = desc(0x1000);
        assert!(d.contains(0x1000));
        assert!(d.contains(0x103f));
        assert!(!d.contains(0x1040));
        assert!(!d.contains(0xfff));
    }

    #[test]
    fn test_bump_then_reuse() {
        let alloc = DescriptorAllocator::new(16, 4, 2);
        let a = alloc.allocate_on(0, desc(0x1000)).unwrap();
        let b = alloc.allocate_on(0, desc(0x2000)).unwrap();
        assert_ne!(a, b);

        let freed = alloc.free_on(0, a).unwrap();
        assert!(freed.state.contains(DescriptorState::WAS_FREED));
        assert!(!freed.is_active());

        let c = alloc.allocate_on(0, desc(0x3000)).unwrap();
        assert_eq!(c, a);
        assert_eq!(alloc.get(c).unwrap().base_address, 0x3000);
        assert_eq!(alloc.high_water(), 2);
    }

    #[test]
    fn test_free_list_is_per_cpu() {
        let alloc = DescriptorAllocator::new(16, 4, 2);
        let a = alloc.allocate_on(0, desc(0x1000)).unwrap();
        alloc.free_on(0, a).unwrap();

        let b = alloc.allocate_on(1, desc(0x2000)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = DescriptorAllocator::new(3, 2, 1);
        for i in 0..3 {
            alloc.allocate_on(0, desc(0x1000 * (i + 1))).unwrap();
        }
        assert_eq!(alloc.allocate_on(0, desc(0x9000)), Err(Error::Exhausted));
        assert_eq!(alloc.active_count(), 3);
    }

    #[test]
    fn test_reclaim_last_unbumps() {
        let alloc = DescriptorAllocator::new(8, 4, 1);
        let a = alloc.allocate_on(0, desc(0x1000)).unwrap();
        alloc.reclaim_last(a).unwrap();
        assert_eq!(alloc.high_water(), 0);
        assert_eq!(alloc.allocate_on(0, desc(0x2000)).unwrap(), a);
    }

    #[test]
    fn test_invalid_index() {
        let alloc = DescriptorAllocator::new(8, 4, 1);
        assert_eq!(alloc.free_on(0, 5), Err(Error::InvalidIndex(5)));
        assert!(alloc.get(0).is_none());
    }

    #[test]
    fn test_error_to_axerror() {
        let err: axerrno::AxError = Error::Exhausted.into();
        assert!(matches!(err, axerrno::AxError::NoMemory));
        let err: axerrno::AxError = Error::NotCanonical(0x0001_0000_0000_1000).into();
        assert!(matches!(err, axerrno::AxError::InvalidInput));
    }
}
