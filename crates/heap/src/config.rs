//! Heap configuration.

/// Size in bytes of the default static heap buffer.
pub const TOTAL_HEAP_SIZE: usize = 20 * 1024;

/// Default alignment of blocks and of the pointers returned by the heap.
pub const BYTE_ALIGNMENT: usize = 8;

/// Options recognised by [`Heap`](crate::Heap).
///
/// # Examples
///
/// ```
/// use heap::HeapConfig;
///
/// let config = HeapConfig::new()
///     .with_alignment(16)
///     .with_clear_memory_on_free(true);
/// assert_eq!(config.alignment, 16);
/// assert!(!config.malloc_failed_hook);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Alignment in bytes of every block.
    ///
    /// Must be a power of two no smaller than the alignment of a pointer. It
    /// also fixes the header size and the minimum block size.
    pub alignment: usize,
    /// Zero the payload of every freed block.
    pub clear_memory_on_free: bool,
    /// Call [`HeapHooks::allocation_failed`](crate::HeapHooks::allocation_failed)
    /// whenever a request cannot be satisfied.
    pub malloc_failed_hook: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alignment: BYTE_ALIGNMENT,
            clear_memory_on_free: false,
            malloc_failed_hook: false,
        }
    }

    #[must_use]
    pub const fn with_alignment(self, alignment: usize) -> Self {
        Self { alignment, ..self }
    }

    #[must_use]
    pub const fn with_clear_memory_on_free(self, clear_memory_on_free: bool) -> Self {
        Self {
            clear_memory_on_free,
            ..self
        }
    }

    #[must_use]
    pub const fn with_malloc_failed_hook(self, malloc_failed_hook: bool) -> Self {
        Self {
            malloc_failed_hook,
            ..self
        }
    }
}
