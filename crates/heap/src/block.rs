//! Block headers stored inline in the heap buffer.
//!
//! Every block, free or allocated, starts with a [`BlockHeader`]. The usable
//! memory handed out to the application begins one aligned header size after
//! the header.
//!
//! ```text
//! Block Layout:
//! ┌──────────────────────────────────────────┬──────────────────────────┐
//! │ BlockHeader (aligned header size)        │ Payload                  │
//! │ ┌─────────────────────┬────────────────┐ │                          │
//! │ │ next_free_block     │ size | MSB     │ │                          │
//! │ └─────────────────────┴────────────────┘ │                          │
//! └──────────────────────────────────────────┴──────────────────────────┘
//!                                            ▲
//!                                            └── pointer returned by malloc
//! ```
//!
//! The most significant bit of `size` is the allocation flag. A block size can
//! therefore never reach half of the address space.

/// Bit of [`BlockHeader::size`] that marks a block as owned by the application.
pub(crate) const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// Returns `true` if `size` leaves the allocation flag clear.
pub(crate) const fn is_valid_block_size(size: usize) -> bool {
    size & ALLOCATED_BIT == 0
}

/// Size of [`BlockHeader`] rounded up to `alignment`.
///
/// `alignment` must be a power of two.
pub(crate) const fn header_size(alignment: usize) -> usize {
    size_of::<BlockHeader>().next_multiple_of(alignment)
}

#[repr(C)]
#[derive(Debug)]
pub(crate) struct BlockHeader {
    /// Next free block in address order.
    ///
    /// Null while the block is allocated, and for the `tail` marker.
    pub(crate) next_free_block: *mut Self,
    /// Total size of the block in bytes, header included.
    pub(crate) size: usize,
}

impl BlockHeader {
    /// Writes a free block header at `addr`.
    ///
    /// # Safety
    ///
    /// - `addr` must be valid for writes of a `BlockHeader` and aligned for it.
    /// - The memory at `addr..addr + size` must belong to the heap buffer and
    ///   must not be part of any other block.
    pub(crate) unsafe fn write(addr: *mut u8, size: usize, next_free_block: *mut Self) -> *mut Self {
        #[expect(clippy::cast_ptr_alignment)]
        let block = addr.cast::<Self>();
        assert!(block.is_aligned(), "block header must be aligned");
        debug_assert!(is_valid_block_size(size));

        unsafe {
            block.write(Self {
                next_free_block,
                size,
            });
        }
        block
    }

    /// Returns a pointer one byte past the end of the block.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid free `BlockHeader` (allocation flag clear)
    /// whose memory lies in a single allocation.
    pub(crate) unsafe fn end(block: *mut Self) -> *mut u8 {
        unsafe {
            debug_assert!(!(*block).is_allocated());
            block.cast::<u8>().byte_add((*block).size)
        }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        self.size & ALLOCATED_BIT != 0
    }

    pub(crate) fn mark_allocated(&mut self) {
        self.size |= ALLOCATED_BIT;
    }

    pub(crate) fn mark_free(&mut self) {
        self.size &= !ALLOCATED_BIT;
    }

    /// Size of the block with the allocation flag masked off.
    pub(crate) fn block_size(&self) -> usize {
        self.size & !ALLOCATED_BIT
    }
}
