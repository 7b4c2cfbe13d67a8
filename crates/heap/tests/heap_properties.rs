//! Property-based tests for the heap
//!
//! Random sequences of allocations and frees are run against heaps of random
//! size and alignment. After every step the free list must account for
//! exactly the free bytes, stay in address order and never hold two adjacent
//! blocks.

use std::{ptr::NonNull, slice};

use heap::{ExclusiveSection, Heap, HeapConfig, HeapHooks, NoHooks, Unsynchronized};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Malloc(usize),
    Calloc(usize, usize),
    /// Frees the live block at this index, modulo the number of live blocks.
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_usize..600).prop_map(Op::Malloc),
        1 => (0_usize..16, 0_usize..48).prop_map(|(count, size)| Op::Calloc(count, size)),
        3 => any::<usize>().prop_map(Op::Free),
    ]
}

fn alignment() -> impl Strategy<Value = usize> {
    prop::sample::select(vec![8_usize, 16, 32, 64])
}

fn assert_consistent<S, H>(heap: &Heap<'_, S, H>)
where
    S: ExclusiveSection,
    H: HeapHooks,
{
    let alignment = heap.config().alignment;
    let blocks = heap.free_blocks().collect::<Vec<_>>();
    let total = blocks.iter().map(|block| block.size).sum::<usize>();
    assert_eq!(total, heap.remaining_free_size());
    assert!(heap.minimum_ever_free_size() <= total);
    for block in &blocks {
        assert!(block.size >= heap.header_size());
        assert!(block.size.is_multiple_of(alignment));
        assert!(block.start.addr().is_multiple_of(alignment));
        assert!(block.start >= heap.begin() && block.end() <= heap.end());
    }
    for pair in blocks.windows(2) {
        assert!(
            pair[0].end() < pair[1].start,
            "free blocks must be address ordered and never adjacent"
        );
    }
}

struct Live {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

impl Live {
    fn new(ptr: NonNull<u8>, len: usize, tag: u8) -> Self {
        unsafe { ptr.as_ptr().write_bytes(tag, len) };
        Self { ptr, len, tag }
    }

    fn is_intact(&self) -> bool {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
            .iter()
            .all(|&b| b == self.tag)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Any sequence of operations keeps the free list consistent and freeing
    /// everything leaves a single block.
    #[test]
    fn free_list_stays_consistent(
        heap_size in 256_usize..8192,
        alignment in alignment(),
        ops in prop::collection::vec(op(), 1..200),
    ) {
        let mut buffer = vec![0_u8; heap_size];
        let config = HeapConfig::new().with_alignment(alignment);
        let heap = Heap::new(&mut buffer, Unsynchronized::new(), NoHooks, config).unwrap();
        let initial = heap.remaining_free_size();
        let mut live = Vec::<Live>::new();

        for (step, op) in ops.into_iter().enumerate() {
            let tag = u8::try_from(step % 251).unwrap() + 1;
            match op {
                Op::Malloc(size) => {
                    let before = heap.remaining_free_size();
                    match heap.malloc(size) {
                        Some(ptr) => {
                            assert!(ptr.addr().get().is_multiple_of(alignment));
                            assert!(heap.remaining_free_size() + size + heap.header_size() <= before);
                            live.push(Live::new(ptr, size, tag));
                        }
                        None => assert_eq!(heap.remaining_free_size(), before),
                    }
                }
                Op::Calloc(count, size) => {
                    if let Some(ptr) = heap.calloc(count, size) {
                        let len = count * size;
                        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
                        assert!(bytes.iter().all(|&b| b == 0));
                        live.push(Live::new(ptr, len, tag));
                    }
                }
                Op::Free(index) => {
                    if !live.is_empty() {
                        let block = live.swap_remove(index % live.len());
                        assert!(block.is_intact());
                        unsafe { heap.free(block.ptr.as_ptr()) };
                    }
                }
            }
            assert_consistent(&heap);
        }

        for block in &live {
            assert!(block.is_intact());
        }
        for block in live {
            unsafe { heap.free(block.ptr.as_ptr()) };
            assert_consistent(&heap);
        }

        let stats = heap.stats();
        assert_eq!(stats.available_bytes, initial);
        assert_eq!(stats.free_block_count, 1);
        assert_eq!(stats.successful_allocations, stats.successful_frees);
    }

    /// Freeing a set of blocks in any order coalesces them back into one.
    #[test]
    fn free_order_does_not_matter(
        sizes in prop::collection::vec(0_usize..128, 1..24),
        order in any::<prop::sample::Index>(),
        alignment in alignment(),
    ) {
        let mut buffer = vec![0_u8; 8192];
        let config = HeapConfig::new().with_alignment(alignment);
        let heap = Heap::new(&mut buffer, Unsynchronized::new(), NoHooks, config).unwrap();
        let initial = heap.remaining_free_size();

        let mut ptrs = sizes
            .iter()
            .map(|&size| heap.malloc(size).unwrap())
            .collect::<Vec<_>>();
        while !ptrs.is_empty() {
            let ptr = ptrs.swap_remove(order.index(ptrs.len()));
            unsafe { heap.free(ptr.as_ptr()) };
            assert_consistent(&heap);
        }

        assert_eq!(heap.remaining_free_size(), initial);
        assert_eq!(heap.stats().free_block_count, 1);
    }
}
