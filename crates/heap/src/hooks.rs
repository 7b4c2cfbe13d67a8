//! Callback points fired by the heap.
//!
//! All hooks run outside the exclusive section, so they may call back into the
//! heap.

use core::ptr::NonNull;

use crate::error::{FreeError, Report};

/// Observer of heap events, passed to [`Heap::new`](crate::Heap::new).
///
/// Every method has a default, so implementors only override what they need.
pub trait HeapHooks {
    /// Called after a successful allocation of a `block_size`-byte block
    /// (header included) whose payload starts at `ptr`.
    fn allocated(&self, ptr: NonNull<u8>, block_size: usize) {
        let _ = (ptr, block_size);
    }

    /// Called after the block with payload `ptr` went back to the free list.
    fn freed(&self, ptr: NonNull<u8>, block_size: usize) {
        let _ = (ptr, block_size);
    }

    /// Called when a request of `wanted_size` bytes fails, if
    /// [`HeapConfig::malloc_failed_hook`](crate::HeapConfig::malloc_failed_hook)
    /// is set.
    fn allocation_failed(&self, wanted_size: usize) {
        let _ = wanted_size;
    }

    /// Called when `free` detects a misuse or corrupted block metadata.
    ///
    /// The heap does not try to recover; this must not return.
    #[track_caller]
    fn corrupted(&self, err: &FreeError) -> ! {
        panic!("heap corruption detected\n\n{}", Report::new(err));
    }
}

/// Ignores every event; corruption still panics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl HeapHooks for NoHooks {}

/// Reports heap activity through the [`log`] facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl HeapHooks for LogHooks {
    fn allocated(&self, ptr: NonNull<u8>, block_size: usize) {
        log::trace!("malloc: {block_size} bytes at {ptr:p}");
    }

    fn freed(&self, ptr: NonNull<u8>, block_size: usize) {
        log::trace!("free: {block_size} bytes at {ptr:p}");
    }

    fn allocation_failed(&self, wanted_size: usize) {
        log::warn!("malloc: no free block for {wanted_size} bytes");
    }

    fn corrupted(&self, err: &FreeError) -> ! {
        log::error!("{err} (detected at {})", err.location());
        panic!("heap corruption detected\n\n{}", Report::new(err));
    }
}
