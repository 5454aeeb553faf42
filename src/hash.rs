//! Hash functions shared by the tables.
//!
//! The CPU-private table mixes raw addresses with the 64-bit murmur3
//! finalizer. The global table hashes arbitrary keys with MurmurHash3
//! x86_32, driven through [`core::hash::Hasher`] so any `Hash` key works.

use core::hash::{BuildHasherDefault, Hasher};

/// Seed for [`Murmur3Hasher`].
pub const HASH_SEED: u32 = 0xDEAD_BEEF;

/// `BuildHasher` for hashbrown maps and the global table.
pub type Murmur3BuildHasher = BuildHasherDefault<Murmur3Hasher>;

/// The murmur3 64-bit finalizer (avalanche mix).
#[inline]
pub const fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

#[inline]
const fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// MurmurHash3 x86_32.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    fmix32(h)
}

/// Streaming hasher: every `write` is chained into the running murmur3
/// state, which starts at [`HASH_SEED`]. `finish` widens the state through
/// [`fmix64`] so the high bits hashbrown uses for its control tags vary.
#[derive(Debug, Clone, Copy)]
pub struct Murmur3Hasher {
    state: u32,
}

impl Default for Murmur3Hasher {
    fn default() -> Self {
        Self { state: HASH_SEED }
    }
}

impl Hasher for Murmur3Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.state = murmur3_32(bytes, self.state);
    }

    fn finish(&self) -> u64 {
        fmix64(self.state as u64)
    }
}
