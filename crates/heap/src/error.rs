use core::{error::Error, fmt, panic};

use snafu::{GenerateImplicitData, Snafu};

/// Source location at which a heap error was built.
///
/// Filled in by snafu as implicit data, so the location of the failing check
/// inside the heap (or of the `#[track_caller]` chain above it) is reported.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Location(&'static panic::Location<'static>);

impl Location {
    #[track_caller]
    fn caller() -> Self {
        Self(panic::Location::caller())
    }

    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::caller()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({self})")
    }
}

/// Formats as `file:line`.
impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file(), self.line())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display(
        "invalid heap alignment {alignment}: must be a power of two of at least {minimum}"
    ))]
    InvalidAlignment {
        alignment: usize,
        minimum: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "heap buffer of {size} bytes is too small, at least {required} bytes are required"
    ))]
    BufferTooSmall {
        size: usize,
        required: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("global heap is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

/// A pointer handed to `free` that the heap cannot take back.
///
/// These indicate caller misuse or corrupted block metadata. [`Heap::free`]
/// treats them as fatal; [`Heap::try_free`] reports them.
///
/// [`Heap::free`]: crate::Heap::free
/// [`Heap::try_free`]: crate::Heap::try_free
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FreeError {
    #[snafu(display("pointer {addr:#x} is outside of the heap ({begin:#x}..{end:#x})"))]
    OutOfBounds {
        addr: usize,
        begin: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {addr:#x} is not aligned to {alignment} bytes"))]
    Misaligned {
        addr: usize,
        alignment: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at {addr:#x} is not allocated (double free?)"))]
    NotAllocated {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocated block at {addr:#x} is still linked into the free list"))]
    StillLinked {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at {addr:#x} has a corrupted size of {size} bytes"))]
    CorruptedSize {
        addr: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl FreeError {
    /// Where the error was detected.
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::OutOfBounds { location, .. }
            | Self::Misaligned { location, .. }
            | Self::NotAllocated { location, .. }
            | Self::StillLinked { location, .. }
            | Self::CorruptedSize { location, .. } => *location,
        }
    }
}

/// Renders an error followed by its chain of sources.
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}
