//! The heap: a single buffer, its free list and its usage counters.
//!
//! # Allocation
//!
//! A request of `n` bytes needs a block of `n` rounded up to the alignment plus
//! one aligned header. The free list is searched **first-fit** in address
//! order; a block larger than needed is split when the remainder exceeds the
//! minimum block size (two headers), otherwise it is handed out whole.
//!
//! # Deallocation
//!
//! A freed block goes back into the address-ordered list and is merged with
//! the free blocks directly before and after it, so no two free blocks are ever
//! adjacent.
//!
//! # Concurrency
//!
//! All access to the free list and counters happens inside the exclusive
//! section the heap was built with. Hooks run outside of it.

use core::{
    alloc::{GlobalAlloc, Layout},
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, Ordering},
};

use snafu::ensure;

use crate::{
    block::{self, BlockHeader},
    config::HeapConfig,
    error::{
        BufferTooSmallSnafu, CorruptedSizeSnafu, FreeError, InitError, InvalidAlignmentSnafu,
        MisalignedSnafu, NotAllocatedSnafu, OutOfBoundsSnafu, StillLinkedSnafu,
    },
    free_list::FreeList,
    hooks::{HeapHooks, NoHooks},
    section::{Exclusive, ExclusiveSection},
    stats::HeapStats,
};

/// A first-fit, address-ordered, coalescing heap over a fixed buffer.
///
/// # Examples
///
/// ```
/// use heap::{Heap, HeapConfig, NoHooks, Unsynchronized};
///
/// let mut buffer = [0u8; 1024];
/// let heap = Heap::new(&mut buffer, Unsynchronized::new(), NoHooks, HeapConfig::new()).unwrap();
///
/// let before = heap.remaining_free_size();
/// let ptr = heap.malloc(100).unwrap();
/// assert!(heap.remaining_free_size() <= before - 100);
///
/// unsafe { heap.free(ptr.as_ptr()) };
/// assert_eq!(heap.remaining_free_size(), before);
/// ```
pub struct Heap<'a, S, H = NoHooks> {
    begin: *mut u8,
    size: usize,
    tail: *mut u8,
    header_size: usize,
    config: HeapConfig,
    state: UnsafeCell<HeapState>,
    state_borrowed: AtomicBool,
    section: S,
    hooks: H,
    _buffer: PhantomData<&'a mut [u8]>,
}

unsafe impl<S, H> Send for Heap<'_, S, H>
where
    S: Send,
    H: Send,
{
}

unsafe impl<S, H> Sync for Heap<'_, S, H>
where
    S: ExclusiveSection + Sync,
    H: Sync,
{
}

impl<S, H> fmt::Debug for Heap<'_, S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("begin", &self.begin)
            .field("end", &self.end())
            .field("header_size", &self.header_size)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct HeapState {
    free_list: FreeList,
    free_bytes_remaining: usize,
    minimum_ever_free_bytes_remaining: usize,
    successful_allocations: usize,
    successful_frees: usize,
}

impl HeapState {
    /// Takes a block of exactly `block_size` bytes, or slightly more when the
    /// remainder is too small to stand alone.
    fn allocate(&mut self, block_size: usize) -> Option<*mut BlockHeader> {
        if block_size > self.free_bytes_remaining {
            return None;
        }

        let block = self.free_list.take_first_fit(block_size)?;
        unsafe {
            self.free_list.split(block, block_size);

            self.free_bytes_remaining -= (*block).size;
            self.minimum_ever_free_bytes_remaining = self
                .minimum_ever_free_bytes_remaining
                .min(self.free_bytes_remaining);

            (*block).mark_allocated();
            (*block).next_free_block = ptr::null_mut();
        }
        self.successful_allocations += 1;
        Some(block)
    }

    /// # Safety
    ///
    /// `block` must be a block of this heap whose allocation flag was just
    /// cleared.
    unsafe fn release(&mut self, block: *mut BlockHeader) {
        unsafe {
            self.free_bytes_remaining += (*block).size;
            self.free_list.insert(block);
        }
        self.successful_frees += 1;
    }
}

/// Exclusive access to the heap state, held inside the exclusive section.
struct StateGuard<'h, S>
where
    S: ExclusiveSection,
{
    state: &'h UnsafeCell<HeapState>,
    borrowed: &'h AtomicBool,
    _section: Exclusive<'h, S>,
}

impl<S> Drop for StateGuard<'_, S>
where
    S: ExclusiveSection,
{
    fn drop(&mut self) {
        self.borrowed.store(false, Ordering::Release);
    }
}

impl<S> Deref for StateGuard<'_, S>
where
    S: ExclusiveSection,
{
    type Target = HeapState;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.state.get() }
    }
}

impl<S> DerefMut for StateGuard<'_, S>
where
    S: ExclusiveSection,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.state.get() }
    }
}

impl<'a, S, H> Heap<'a, S, H>
where
    S: ExclusiveSection,
    H: HeapHooks,
{
    /// Builds a heap over `buffer`.
    ///
    /// The start of the buffer is aligned up to `config.alignment` and the
    /// `tail` marker is carved out of its aligned end; everything in between
    /// becomes a single free block.
    pub fn new(
        buffer: &'a mut [u8],
        section: S,
        hooks: H,
        config: HeapConfig,
    ) -> Result<Self, InitError> {
        unsafe { Self::from_raw_parts(buffer.as_mut_ptr(), buffer.len(), section, hooks, config) }
    }

    /// Builds a heap over the `len` bytes starting at `buffer`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The range `buffer..buffer + len` is valid for reads and writes
    /// - The memory region is not used by anything else for `'a`
    pub unsafe fn from_raw_parts(
        buffer: *mut u8,
        len: usize,
        section: S,
        hooks: H,
        config: HeapConfig,
    ) -> Result<Self, InitError> {
        let alignment = config.alignment;
        let minimum = align_of::<BlockHeader>();
        ensure!(
            alignment.is_power_of_two() && alignment >= minimum,
            InvalidAlignmentSnafu { alignment, minimum }
        );

        let header_size = block::header_size(alignment);
        let min_block_size = header_size.saturating_mul(2);
        let align_offset = buffer.align_offset(alignment);
        // Room for one header-only block and the tail marker.
        let required = align_offset.saturating_add(min_block_size);
        ensure!(len >= required, BufferTooSmallSnafu { size: len, required });

        let begin = unsafe { buffer.add(align_offset) };
        let size = len - align_offset;
        let tail = unsafe { begin.add(size - header_size) }.map_addr(|addr| addr & !(alignment - 1));
        let (free_list, first_size) = unsafe { FreeList::new(begin, tail, min_block_size) };

        log::debug!(
            "heap: {begin:p}..{:p}, {first_size} bytes free, alignment {alignment}",
            begin.wrapping_add(size)
        );

        Ok(Self {
            begin,
            size,
            tail,
            header_size,
            config,
            state: UnsafeCell::new(HeapState {
                free_list,
                free_bytes_remaining: first_size,
                minimum_ever_free_bytes_remaining: first_size,
                successful_allocations: 0,
                successful_frees: 0,
            }),
            state_borrowed: AtomicBool::new(false),
            section,
            hooks,
            _buffer: PhantomData,
        })
    }

    #[track_caller]
    fn lock(&self) -> StateGuard<'_, S> {
        let section = Exclusive::enter(&self.section);
        assert!(
            !self.state_borrowed.swap(true, Ordering::Acquire),
            "heap re-entered while its state is borrowed"
        );
        StateGuard {
            state: &self.state,
            borrowed: &self.state_borrowed,
            _section: section,
        }
    }

    /// Block size needed to serve `wanted_size` payload bytes, or `None` if it
    /// overflows or collides with the allocation flag.
    fn block_size_for(&self, wanted_size: usize) -> Option<usize> {
        let block_size = wanted_size
            .checked_next_multiple_of(self.config.alignment)?
            .checked_add(self.header_size)?;
        block::is_valid_block_size(block_size).then_some(block_size)
    }

    /// Allocates at least `wanted_size` bytes.
    ///
    /// Returns `None` if no single free block is large enough, even when the
    /// total free space would be. A zero-byte request yields a valid,
    /// header-only block that must be freed like any other.
    ///
    /// The returned pointer is aligned to [`HeapConfig::alignment`].
    pub fn malloc(&self, wanted_size: usize) -> Option<NonNull<u8>> {
        let block = self
            .block_size_for(wanted_size)
            .and_then(|block_size| self.lock().allocate(block_size));

        let Some(block) = block else {
            if self.config.malloc_failed_hook {
                self.hooks.allocation_failed(wanted_size);
            }
            return None;
        };

        let (ptr, block_size) = unsafe {
            let ptr = NonNull::new_unchecked(block.cast::<u8>().add(self.header_size));
            (ptr, (*block).block_size())
        };
        debug_assert!(ptr.addr().get().is_multiple_of(self.config.alignment));
        self.hooks.allocated(ptr, block_size);
        Some(ptr)
    }

    /// Allocates `count * element_size` zeroed bytes.
    ///
    /// Returns `None` without touching the heap if the multiplication
    /// overflows.
    pub fn calloc(&self, count: usize, element_size: usize) -> Option<NonNull<u8>> {
        let size = count.checked_mul(element_size)?;
        let ptr = self.malloc(size)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, size);
        }
        Some(ptr)
    }

    /// Returns a block to the heap. Null is ignored.
    ///
    /// A pointer that does not denote a live block of this heap is fatal and
    /// reported through [`HeapHooks::corrupted`].
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by [`Self::malloc`] or
    /// [`Self::calloc`] on this heap that has not been freed yet. The block
    /// must no longer be used afterwards.
    #[track_caller]
    pub unsafe fn free(&self, ptr: *mut u8) {
        if let Err(err) = unsafe { self.try_free(ptr) } {
            self.hooks.corrupted(&err);
        }
    }

    /// Like [`Self::free`], but reports an invalid pointer instead of treating
    /// it as fatal.
    ///
    /// The checks catch pointers outside the heap, misaligned pointers, double
    /// frees and damaged headers. They cannot catch every misuse.
    ///
    /// # Safety
    ///
    /// Same as [`Self::free`]. In addition, no other context may be writing
    /// to the header of the block `ptr` belongs to.
    pub unsafe fn try_free(&self, ptr: *mut u8) -> Result<(), FreeError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        let block = self.header_of(ptr)?;
        let addr = block.addr();
        let block_size = unsafe {
            ensure!((*block).is_allocated(), NotAllocatedSnafu { addr });
            ensure!(
                (*block).next_free_block.is_null(),
                StillLinkedSnafu { addr }
            );

            let size = (*block).block_size();
            ensure!(
                size >= self.header_size
                    && size <= self.tail.addr() - addr
                    && size.is_multiple_of(self.config.alignment),
                CorruptedSizeSnafu { addr, size }
            );

            (*block).mark_free();
            if self.config.clear_memory_on_free {
                ptr.as_ptr().write_bytes(0, size - self.header_size);
            }
            size
        };

        unsafe {
            self.lock().release(block);
        }
        self.hooks.freed(ptr, block_size);
        Ok(())
    }

    fn header_of(&self, ptr: NonNull<u8>) -> Result<*mut BlockHeader, FreeError> {
        let addr = ptr.addr().get();
        let begin = self.begin.addr() + self.header_size;
        let end = self.tail.addr();
        ensure!(
            (begin..=end).contains(&addr),
            OutOfBoundsSnafu { addr, begin, end }
        );
        let alignment = self.config.alignment;
        ensure!(
            addr.is_multiple_of(alignment),
            MisalignedSnafu { addr, alignment }
        );

        #[expect(clippy::cast_ptr_alignment)]
        let block = ptr
            .as_ptr()
            .wrapping_sub(self.header_size)
            .cast::<BlockHeader>();
        Ok(block)
    }

    /// Collects the free-list statistics and the usage counters.
    ///
    /// The free list is scanned under one exclusive section and the counters
    /// are read under a second one, so a concurrent operation may slip in
    /// between.
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats::default();
        let mut smallest = usize::MAX;
        for block in self.free_blocks() {
            stats.free_block_count += 1;
            stats.largest_free_block_bytes = stats.largest_free_block_bytes.max(block.size);
            smallest = smallest.min(block.size);
        }
        if stats.free_block_count > 0 {
            stats.smallest_free_block_bytes = smallest;
        }

        let state = self.lock();
        stats.available_bytes = state.free_bytes_remaining;
        stats.successful_allocations = state.successful_allocations;
        stats.successful_frees = state.successful_frees;
        stats.minimum_ever_free_bytes = state.minimum_ever_free_bytes_remaining;
        stats
    }

    /// Total size of the free blocks. The space may be fragmented.
    pub fn remaining_free_size(&self) -> usize {
        self.lock().free_bytes_remaining
    }

    /// Lowest value [`Self::remaining_free_size`] has ever had.
    pub fn minimum_ever_free_size(&self) -> usize {
        self.lock().minimum_ever_free_bytes_remaining
    }

    /// Iterates over the free blocks in address order.
    ///
    /// The exclusive section is held until the iterator is dropped. Calling
    /// into the heap while iterating panics, or deadlocks with a
    /// non-reentrant section.
    pub fn free_blocks(&self) -> FreeBlocks<'_, S> {
        let guard = self.lock();
        let next = guard.free_list.first();
        FreeBlocks { guard, next }
    }
}

impl<S, H> Heap<'_, S, H> {
    /// First byte of the managed buffer, after alignment.
    pub fn begin(&self) -> *const u8 {
        self.begin
    }

    /// One past the last byte of the managed buffer.
    pub fn end(&self) -> *const u8 {
        self.begin.wrapping_add(self.size)
    }

    /// Configuration the heap was built with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Size of the header in front of every block.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Hooks receiving this heap's events.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Exclusive section guarding the heap state.
    pub fn section(&self) -> &S {
        &self.section
    }
}

/// A free block reported by [`Heap::free_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    /// Address of the block header.
    pub start: *const u8,
    /// Size of the block, header included.
    pub size: usize,
}

impl FreeBlock {
    /// One past the last byte of the block.
    pub fn end(&self) -> *const u8 {
        self.start.wrapping_add(self.size)
    }
}

/// Iterator over the free blocks of a heap, returned by [`Heap::free_blocks`].
///
/// Holds the heap's exclusive section until dropped.
pub struct FreeBlocks<'h, S>
where
    S: ExclusiveSection,
{
    guard: StateGuard<'h, S>,
    next: Option<*mut BlockHeader>,
}

impl<S> Iterator for FreeBlocks<'_, S>
where
    S: ExclusiveSection,
{
    type Item = FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        unsafe {
            self.next = self.guard.free_list.after(block);
            Some(FreeBlock {
                start: block.cast_const().cast(),
                size: (*block).size,
            })
        }
    }
}

unsafe impl<S, H> GlobalAlloc for Heap<'_, S, H>
where
    S: ExclusiveSection,
    H: HeapHooks,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.config.alignment {
            return ptr::null_mut();
        }
        self.malloc(layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.config.alignment {
            return ptr::null_mut();
        }
        self.calloc(1, layout.size())
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }
}
