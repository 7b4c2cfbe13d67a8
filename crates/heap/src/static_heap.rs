use core::{
    cell::UnsafeCell,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

/// Statically allocated backing storage for a heap.
///
/// The bytes can be taken out exactly once, which makes handing out a
/// `&'static mut` sound.
#[repr(C, align(16))]
pub struct HeapBuffer<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
    taken: AtomicBool,
}

unsafe impl<const N: usize> Sync for HeapBuffer<N> {}

impl<const N: usize> Default for HeapBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for HeapBuffer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("len", &N)
            .field("taken", &self.taken.load(Ordering::Relaxed))
            .finish()
    }
}

impl<const N: usize> HeapBuffer<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
            taken: AtomicBool::new(false),
        }
    }

    /// Returns the buffer on the first call, `None` afterwards.
    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(unsafe { &mut *self.bytes.get() })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_once() {
        static BUFFER: HeapBuffer<256> = HeapBuffer::new();

        let bytes = BUFFER.take().unwrap();
        assert_eq!(bytes.len(), 256);
        assert!(bytes.as_ptr().addr().is_multiple_of(16));
        assert!(BUFFER.take().is_none());
    }
}
