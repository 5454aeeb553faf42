//! Tagged address codec.
//!
//! A watched pointer carries its descriptor index in the x86-64
//! canonical-address gap, so metadata lookup is a shift and a mask instead
//! of a side-table search.
//!
//! ```text
//!  63  62            48 47                                  0
//! +---+----------------+-------------------------------------+
//! | F |     index      |             displacement            |
//! +---+----------------+-------------------------------------+
//! ```
//!
//! Canonical addresses replicate bit 47 into bits 48..=63. A tagged
//! pointer has `F != bit 47`, which no canonical address can satisfy, so
//! dereferencing one faults instead of touching the wrong memory. All
//! bit twiddling lives here; callers only see [`tag`], [`decode`],
//! [`is_tagged`] and [`index_of`].

/// Bit position of the lowest index bit.
pub const INDEX_OFFSET: u32 = 48;

/// Width of the index field.
pub const INDEX_BITS: u32 = 15;

/// Number of distinct descriptor indices a tagged pointer can carry.
pub const MAX_INDEX_COUNT: usize = 1 << INDEX_BITS;

/// Mask of the index after it has been shifted down.
pub const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Low-order address bits kept verbatim in a tagged pointer.
pub const DISPLACEMENT_MASK: u64 = (1 << INDEX_OFFSET) - 1;

/// Bit that replicates into the high half of canonical addresses.
pub const SIGN_BIT: u32 = INDEX_OFFSET - 1;

/// The tag flag.
pub const FLAG_BIT: u32 = 63;

/// Returns true if `ptr` carries a descriptor index.
#[inline]
pub const fn is_tagged(ptr: u64) -> bool {
    ((ptr >> FLAG_BIT) ^ (ptr >> SIGN_BIT)) & 1 == 1
}

/// Strip the tag and restore the canonical high bits.
///
/// Pure and branch-free: sign-extends bit 47 over the upper 16 bits.
/// Untagged canonical pointers come back unchanged.
#[inline]
pub const fn decode(ptr: u64) -> u64 {
    (((ptr << (64 - INDEX_OFFSET)) as i64) >> (64 - INDEX_OFFSET)) as u64
}

/// Descriptor index carried by `ptr`, if it is tagged.
#[inline]
pub const fn index_of(ptr: u64) -> Option<u32> {
    if is_tagged(ptr) {
        Some(((ptr >> INDEX_OFFSET) & INDEX_MASK) as u32)
    } else {
        None
    }
}

/// Embed `index` into the canonical address `addr`.
///
/// `index` must be below [`MAX_INDEX_COUNT`]; higher bits are dropped.
/// Tagging an already-tagged pointer returns it unchanged.
#[inline]
pub const fn tag(addr: u64, index: u32) -> u64 {
    if is_tagged(addr) {
        return addr;
    }
    let flag = (!(addr >> SIGN_BIT) & 1) << FLAG_BIT;
    let index = ((index as u64) & INDEX_MASK) << INDEX_OFFSET;
    flag | index | (addr & DISPLACEMENT_MASK)
}
