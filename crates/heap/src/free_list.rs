//! Address-ordered free list with immediate coalescing.
//!
//! The list is threaded through the [`BlockHeader`]s of the free blocks and is
//! bounded by two markers:
//!
//! - `head` lives inside [`FreeList`] itself. It is never heap space and only
//!   points at the lowest free block.
//! - `tail` is a zero-sized header carved out of the top of the heap buffer.
//!   It terminates the list and is never merged into a neighbour.
//!
//! ```text
//!  head ──► [free A] ──► [free B] ──► ... ──► tail ──► null
//!           low address                       highest aligned address
//! ```
//!
//! Two free blocks are never adjacent in memory: [`FreeList::insert`] merges a
//! returned block with its predecessor and successor whenever they touch.

use core::ptr;

use crate::block::BlockHeader;

pub(crate) struct FreeList {
    head: BlockHeader,
    tail: *mut BlockHeader,
    min_block_size: usize,
}

impl FreeList {
    /// Lays out the `tail` marker at `tail` and a single free block spanning
    /// `start..tail`.
    ///
    /// Returns the list and the size of the initial free block.
    ///
    /// # Safety
    ///
    /// - `start` and `tail` must be aligned for `BlockHeader` and lie in the same
    ///   allocation, with `start < tail`.
    /// - `tail..tail + size_of::<BlockHeader>()` must be valid for writes.
    /// - The memory in `start..tail` must be exclusively owned by the list.
    pub(crate) unsafe fn new(start: *mut u8, tail: *mut u8, min_block_size: usize) -> (Self, usize) {
        unsafe {
            assert!(start < tail, "heap must leave room for one block below the tail");
            let tail = BlockHeader::write(tail, 0, ptr::null_mut());
            let first_size = tail.byte_offset_from_unsigned(start);
            let first = BlockHeader::write(start, first_size, tail);

            let list = Self {
                head: BlockHeader {
                    next_free_block: first,
                    size: 0,
                },
                tail,
                min_block_size,
            };
            (list, first_size)
        }
    }

    /// Inserts a free block into the list, keeping address order and merging
    /// it with the blocks directly before and after it.
    ///
    /// # Safety
    ///
    /// - `block` must point to a free header inside the heap buffer, below
    ///   `tail`, that is not already linked into the list.
    /// - The memory covered by `block` must not overlap any listed block.
    pub(crate) unsafe fn insert(&mut self, mut block: *mut BlockHeader) {
        unsafe {
            assert!(block < self.tail, "inserted block must lie below the tail");

            // Find the last node whose successor lies above `block`.
            let mut iterator: *mut BlockHeader = &raw mut self.head;
            while (*iterator).next_free_block < block {
                iterator = (*iterator).next_free_block;
            }

            if ptr::eq(BlockHeader::end(iterator), block.cast()) {
                (*iterator).size += (*block).size;
                block = iterator;
            }

            let next = (*iterator).next_free_block;
            if ptr::eq(BlockHeader::end(block), next.cast()) {
                if ptr::eq(next, self.tail) {
                    (*block).next_free_block = self.tail;
                } else {
                    (*block).size += (*next).size;
                    (*block).next_free_block = (*next).next_free_block;
                }
            } else {
                (*block).next_free_block = next;
            }

            // A block merged on both sides already carries the right link.
            if !ptr::eq(iterator, block) {
                (*iterator).next_free_block = block;
            }
        }
    }

    /// Unlinks and returns the first block, in address order, whose size is at
    /// least `wanted`.
    ///
    /// The block is returned whole; see [`Self::split`].
    pub(crate) fn take_first_fit(&mut self, wanted: usize) -> Option<*mut BlockHeader> {
        unsafe {
            let mut previous: *mut BlockHeader = &raw mut self.head;
            let mut block = self.head.next_free_block;
            while (*block).size < wanted && !(*block).next_free_block.is_null() {
                previous = block;
                block = (*block).next_free_block;
            }

            if ptr::eq(block, self.tail) {
                return None;
            }

            (*previous).next_free_block = (*block).next_free_block;
            (*block).next_free_block = ptr::null_mut();
            Some(block)
        }
    }

    /// Shrinks an unlinked block to `wanted` bytes and returns the remainder to
    /// the list, if the remainder exceeds the minimum block size.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by [`Self::take_first_fit`] with a
    /// `wanted` no greater than its size, and must not be relinked yet.
    /// `wanted` must be a multiple of the heap alignment.
    pub(crate) unsafe fn split(&mut self, block: *mut BlockHeader, wanted: usize) {
        unsafe {
            let leftover = (*block).size - wanted;
            if leftover <= self.min_block_size {
                return;
            }

            let remainder = BlockHeader::write(
                block.cast::<u8>().byte_add(wanted),
                leftover,
                ptr::null_mut(),
            );
            (*block).size = wanted;
            self.insert(remainder);
        }
    }

    /// Returns the lowest free block, if any.
    pub(crate) fn first(&self) -> Option<*mut BlockHeader> {
        unsafe { self.after(&raw const self.head) }
    }

    /// Returns the free block following `block` in the list, sentinels
    /// excluded.
    ///
    /// # Safety
    ///
    /// `block` must be `head` or a block currently linked into this list.
    pub(crate) unsafe fn after(&self, block: *const BlockHeader) -> Option<*mut BlockHeader> {
        let next = unsafe { (*block).next_free_block };
        (!next.is_null() && !ptr::eq(next, self.tail)).then_some(next)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;
    use core::alloc::Layout;

    use super::*;
    use crate::block;

    const HEADER: usize = block::header_size(8);

    fn with_test_list<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, &mut FreeList),
    {
        unsafe {
            let layout = Layout::from_size_align(heap_size, 16).unwrap();
            let start = alloc::alloc::alloc(layout);
            start.write_bytes(0x11, heap_size);
            let tail = start.add(heap_size - HEADER);
            let (mut list, first_size) = FreeList::new(start, tail, HEADER * 2);
            assert_eq!(first_size, heap_size - HEADER);
            test_fn(start, &mut list);
            alloc::alloc::dealloc(start, layout);
        }
    }

    /// Returns `(offset, size)` of each listed block.
    fn blocks(start: *mut u8, list: &FreeList) -> Vec<(usize, usize)> {
        let mut blocks = Vec::new();
        let mut next = list.first();
        while let Some(block) = next {
            unsafe {
                blocks.push((block.byte_offset_from_unsigned(start), (*block).size));
                next = list.after(block);
            }
        }
        blocks
    }

    #[test]
    fn test_new_list_has_one_block() {
        with_test_list(256, |start, list| {
            assert_eq!(blocks(start, list), [(0, 256 - HEADER)]);
            unsafe {
                assert_eq!((*list.tail).size, 0);
                assert!((*list.tail).next_free_block.is_null());
            }
        });
    }

    #[test]
    fn test_take_first_fit_and_split() {
        with_test_list(256, |start, list| unsafe {
            let block = list.take_first_fit(64).unwrap();
            assert_eq!(block.cast::<u8>(), start);
            assert!(list.first().is_none());

            list.split(block, 64);
            assert_eq!((*block).size, 64);
            assert_eq!(blocks(start, list), [(64, 256 - HEADER - 64)]);
        });
    }

    #[test]
    fn test_split_keeps_small_remainder() {
        with_test_list(256, |start, list| unsafe {
            let whole = 256 - HEADER;
            let wanted = whole - HEADER * 2;
            let block = list.take_first_fit(wanted).unwrap();
            list.split(block, wanted);
            assert_eq!((*block).size, whole);
            assert!(blocks(start, list).is_empty());
        });
    }

    #[test]
    fn test_take_first_fit_fails_at_tail() {
        with_test_list(128, |start, list| {
            assert!(list.take_first_fit(128).is_none());
            assert_eq!(blocks(start, list).len(), 1);
        });
    }

    #[test]
    fn test_take_first_fit_skips_small_blocks() {
        with_test_list(512, |start, list| unsafe {
            let a = list.take_first_fit(64).unwrap();
            list.split(a, 64);
            let b = list.take_first_fit(64).unwrap();
            list.split(b, 64);
            let c = list.take_first_fit(128).unwrap();
            list.split(c, 128);

            // free a, keep b allocated so that a stays a separate 64-byte hole
            list.insert(a);
            assert_eq!(blocks(start, list), [(0, 64), (256, 512 - HEADER - 256)]);

            let d = list.take_first_fit(96).unwrap();
            assert_eq!(d.byte_offset_from_unsigned(start), 256);
            let e = list.take_first_fit(64).unwrap();
            assert_eq!(e.cast::<u8>(), start);
        });
    }

    #[test]
    fn test_insert_merges_left() {
        with_test_list(512, |start, list| unsafe {
            let a = list.take_first_fit(64).unwrap();
            list.split(a, 64);
            let b = list.take_first_fit(64).unwrap();
            list.split(b, 64);
            let c = list.take_first_fit(64).unwrap();
            list.split(c, 64);

            list.insert(a);
            list.insert(b);
            assert_eq!(blocks(start, list), [(0, 128), (192, 512 - HEADER - 192)]);
        });
    }

    #[test]
    fn test_insert_merges_right() {
        with_test_list(512, |start, list| unsafe {
            let a = list.take_first_fit(64).unwrap();
            list.split(a, 64);
            let b = list.take_first_fit(64).unwrap();
            list.split(b, 64);
            let c = list.take_first_fit(64).unwrap();
            list.split(c, 64);

            list.insert(c);
            assert_eq!(blocks(start, list), [(128, 512 - HEADER - 128)]);
            list.insert(a);
            assert_eq!(blocks(start, list), [(0, 64), (128, 512 - HEADER - 128)]);
        });
    }

    #[test]
    fn test_insert_merges_both_sides() {
        with_test_list(512, |start, list| unsafe {
            let a = list.take_first_fit(64).unwrap();
            list.split(a, 64);
            let b = list.take_first_fit(64).unwrap();
            list.split(b, 64);
            let c = list.take_first_fit(64).unwrap();
            list.split(c, 64);

            list.insert(a);
            list.insert(c);
            assert_eq!(blocks(start, list), [(0, 64), (128, 512 - HEADER - 128)]);

            list.insert(b);
            assert_eq!(blocks(start, list), [(0, 512 - HEADER)]);
        });
    }

    #[test]
    fn test_insert_does_not_absorb_tail() {
        with_test_list(256, |start, list| unsafe {
            let whole = list.take_first_fit(256 - HEADER).unwrap();
            assert!(list.first().is_none());

            list.insert(whole);
            assert_eq!(blocks(start, list), [(0, 256 - HEADER)]);
            assert!(ptr::eq((*whole).next_free_block, list.tail));
            assert_eq!((*list.tail).size, 0);
        });
    }

    #[test]
    fn test_insert_keeps_address_order() {
        with_test_list(1024, |start, list| unsafe {
            let mut taken = Vec::new();
            for _ in 0..6 {
                let block = list.take_first_fit(64).unwrap();
                list.split(block, 64);
                taken.push(block);
            }

            // free every other block, highest address first
            for block in taken.iter().step_by(2).rev() {
                list.insert(*block);
            }

            let offsets = blocks(start, list)
                .into_iter()
                .map(|(offset, _)| offset)
                .collect::<Vec<_>>();
            assert_eq!(offsets, [0, 128, 256, 384]);
        });
    }
}
