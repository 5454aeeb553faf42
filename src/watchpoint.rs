//! Watched pointers: the tag codec on top of the descriptor allocator.

use crate::descriptor::{Descriptor, DescriptorAllocator, Error};
use crate::tag;

/// Hands out tagged pointers backed by descriptors.
pub struct Watchpoints {
    descriptors: DescriptorAllocator,
}

impl Watchpoints {
    pub fn new(descriptors: DescriptorAllocator) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    /// Start watching `ptr`, returning the tagged pointer.
    ///
    /// Already-tagged pointers are returned unchanged. Non-canonical
    /// pointers are rejected, since the tag would overwrite their high bits. On
    /// [`Error::Exhausted`] the caller should keep using the plain pointer;
    /// nothing has been modified.
    pub fn encode(&self, ptr: u64, size: usize, owner: u64) -> Result<u64, Error> {
        if ptr == 0 {
            return Err(Error::NullPointer);
        }
        if tag::is_tagged(ptr) {
            return Ok(ptr);
        }
        if tag::decode(ptr) != ptr {
            return Err(Error::NotCanonical(ptr));
        }
        let index = self.descriptors.allocate(Descriptor::new(ptr, size, owner))?;
        Ok(tag::tag(ptr, index))
    }

    /// Strip the tag from `ptr`.
    #[inline]
    pub fn decode(&self, ptr: u64) -> u64 {
        tag::decode(ptr)
    }

    #[inline]
    pub fn is_tagged(&self, ptr: u64) -> bool {
        tag::is_tagged(ptr)
    }

    /// Descriptor behind a tagged pointer, if it is still active.
    pub fn descriptor(&self, ptr: u64) -> Option<Descriptor> {
        self.descriptors.get(tag::index_of(ptr)?)
    }

    /// Stop watching `ptr` and return its retired descriptor.
    pub fn release(&self, ptr: u64) -> Result<Descriptor, Error> {
        let index = tag::index_of(ptr).ok_or(Error::NotTagged(ptr))?;
        self.descriptors.free(index)
    }
}
