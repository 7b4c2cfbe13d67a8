//! A heap that lives in a `static` and is set up once at startup.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use snafu::ensure;
use spin::Once;

use crate::{
    config::HeapConfig,
    error::{AlreadyInitializedSnafu, InitError},
    heap::Heap,
    hooks::{HeapHooks, NoHooks},
    section::ExclusiveSection,
};

/// A [`Heap`] over a `'static` buffer, usable as `#[global_allocator]`.
///
/// Allocations made before [`GlobalHeap::init`] fail.
///
/// # Examples
///
/// ```
/// use heap::{GlobalHeap, HeapBuffer, HeapConfig, NoHooks, SpinSection, TOTAL_HEAP_SIZE};
///
/// static BUFFER: HeapBuffer<TOTAL_HEAP_SIZE> = HeapBuffer::new();
/// static HEAP: GlobalHeap<SpinSection> = GlobalHeap::new();
///
/// let buffer = BUFFER.take().unwrap();
/// let heap = HEAP
///     .init(buffer, SpinSection::new(), NoHooks, HeapConfig::new())
///     .unwrap();
/// assert!(heap.malloc(64).is_some());
/// ```
pub struct GlobalHeap<S, H = NoHooks> {
    heap: Once<Heap<'static, S, H>>,
}

impl<S, H> Default for GlobalHeap<S, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, H> GlobalHeap<S, H> {
    #[must_use]
    pub const fn new() -> Self {
        Self { heap: Once::new() }
    }

    pub fn get(&self) -> Option<&Heap<'static, S, H>> {
        self.heap.get()
    }
}

impl<S, H> GlobalHeap<S, H>
where
    S: ExclusiveSection,
    H: HeapHooks,
{
    /// Builds the heap over `buffer`.
    ///
    /// Fails with [`InitError::AlreadyInitialized`] on every call but the first
    /// successful one.
    pub fn init(
        &self,
        buffer: &'static mut [u8],
        section: S,
        hooks: H,
        config: HeapConfig,
    ) -> Result<&Heap<'static, S, H>, InitError> {
        let mut built = false;
        let heap = self.heap.try_call_once(|| {
            built = true;
            Heap::new(buffer, section, hooks, config)
        })?;
        ensure!(built, AlreadyInitializedSnafu);
        Ok(heap)
    }
}

unsafe impl<S, H> GlobalAlloc for GlobalHeap<S, H>
where
    S: ExclusiveSection,
    H: HeapHooks,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match self.get() {
            Some(heap) => unsafe { heap.alloc(layout) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        match self.get() {
            Some(heap) => unsafe { heap.alloc_zeroed(layout) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(heap) = self.get() {
            unsafe { heap.dealloc(ptr, layout) }
        }
    }
}
