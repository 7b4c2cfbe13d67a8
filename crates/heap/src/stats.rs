use core::fmt;

/// Snapshot of the heap usage returned by [`Heap::stats`](crate::Heap::stats).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Size of the largest free block, header included.
    pub largest_free_block_bytes: usize,
    /// Size of the smallest free block, header included. Zero if no block is
    /// free.
    pub smallest_free_block_bytes: usize,
    pub free_block_count: usize,
    /// Sum of the sizes of all free blocks.
    pub available_bytes: usize,
    pub successful_allocations: usize,
    pub successful_frees: usize,
    /// Low-water mark of `available_bytes` since the heap was built.
    pub minimum_ever_free_bytes: usize,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "available:     {} bytes", self.available_bytes)?;
        writeln!(f, "minimum ever:  {} bytes", self.minimum_ever_free_bytes)?;
        writeln!(
            f,
            "free blocks:   {} (largest {} bytes, smallest {} bytes)",
            self.free_block_count, self.largest_free_block_bytes, self.smallest_free_block_bytes
        )?;
        write!(
            f,
            "allocations:   {} ({} freed)",
            self.successful_allocations, self.successful_frees
        )
    }
}
