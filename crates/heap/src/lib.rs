//! First-fit, address-ordered, coalescing heap for RTOS-style targets.
//!
//! The heap manages one contiguous byte buffer. Free blocks form a singly
//! linked list threaded through their own headers and kept in address order,
//! so a returned block is merged with its free neighbours immediately and
//! fragmentation stays bounded.
//!
//! This crate is `no_std` and does not depend on `alloc`.
//!
//! # Overview
//!
//! - [`Heap`] owns the buffer and serves `malloc`, `free` and `calloc`
//!   style requests. It also implements [`GlobalAlloc`](core::alloc::GlobalAlloc).
//! - [`GlobalHeap`] wraps a heap built at startup from a `'static` buffer,
//!   such as a [`HeapBuffer`], for use as `#[global_allocator]`.
//! - [`ExclusiveSection`] is the seam to the environment. The heap state is
//!   only touched between `enter` and `exit` of the section it was built with:
//!   scheduler suspension ([`SuspendAll`]), interrupt masking
//!   ([`InterruptMask`]), a spin lock ([`SpinSection`]) or nothing at all
//!   ([`Unsynchronized`]).
//! - [`HeapHooks`] receives allocation, free, failure and corruption events.
//!   [`LogHooks`] forwards them to the [`log`] facade.
//!
//! # Usage
//!
//! ```rust
//! use heap::{Heap, HeapConfig, LogHooks, SpinSection};
//!
//! let mut buffer = vec![0u8; 4096];
//! let heap = Heap::new(&mut buffer, SpinSection::new(), LogHooks, HeapConfig::new()).unwrap();
//!
//! let numbers = heap.calloc(16, size_of::<u32>()).unwrap();
//! let stats = heap.stats();
//! assert_eq!(stats.successful_allocations, 1);
//! assert_eq!(stats.free_block_count, 1);
//!
//! unsafe { heap.free(numbers.as_ptr()) };
//! assert_eq!(heap.stats().free_block_count, 1);
//! ```
//!
//! # Block sizes
//!
//! A request for `n` bytes consumes `n` rounded up to
//! [`HeapConfig::alignment`] plus one header, whose size is also rounded up to
//! the alignment. A free block is split only when the remainder is larger than
//! two headers; otherwise the caller gets the whole block.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod block;
mod config;
mod error;
mod free_list;
mod global;
mod heap;
mod hooks;
mod section;
mod static_heap;
mod stats;

pub use self::{
    config::{BYTE_ALIGNMENT, HeapConfig, TOTAL_HEAP_SIZE},
    error::{FreeError, InitError, Location, Report},
    global::GlobalHeap,
    heap::{FreeBlock, FreeBlocks, Heap},
    hooks::{HeapHooks, LogHooks, NoHooks},
    section::{
        Exclusive, ExclusiveSection, InterruptControl, InterruptMask, SpinSection, SuspendAll,
        TaskScheduler, Unsynchronized,
    },
    static_heap::HeapBuffer,
    stats::HeapStats,
};
