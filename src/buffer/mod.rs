//! Graphics buffer allocation and ownership tracking

pub mod heap;
pub mod table;

use std::fmt;
use std::os::fd::RawFd;

use memmap2::MmapMut;

use crate::capture::frame::PixelFormat;
use crate::error::Result;

pub use heap::HeapAllocator;
pub use table::{BufferCategory, BufferTable, OwnedBuffer};

/// Opaque handle issued by a [`BufferAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Intended consumers of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const CAPTURE: BufferUsage = BufferUsage(1 << 0);
    pub const CPU_READ: BufferUsage = BufferUsage(1 << 1);
    pub const CPU_WRITE: BufferUsage = BufferUsage(1 << 2);
    pub const COMPOSER: BufferUsage = BufferUsage(1 << 3);
    pub const ENCODER: BufferUsage = BufferUsage(1 << 4);
    pub const TRANSFORM: BufferUsage = BufferUsage(1 << 5);

    pub const fn union(self, other: BufferUsage) -> BufferUsage {
        BufferUsage(self.0 | other.0)
    }

    pub const fn contains(self, other: BufferUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = BufferUsage;

    fn bitor(self, rhs: BufferUsage) -> BufferUsage {
        self.union(rhs)
    }
}

/// What to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Row alignment in pixels
    pub stride_align: u32,
    pub usage: BufferUsage,
}

impl BufferSpec {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            width,
            height,
            format,
            stride_align: 1,
            usage,
        }
    }

    pub fn stride_align(mut self, align: u32) -> Self {
        self.stride_align = align.max(1);
        self
    }

    pub fn stride(&self) -> u32 {
        crate::utils::align_up(self.width, self.stride_align)
    }

    pub fn byte_len(&self) -> usize {
        self.format.frame_size(self.stride(), self.height)
    }
}

/// A freshly allocated or imported buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: BufferHandle,
    pub fd: RawFd,
    pub len: usize,
    pub stride: u32,
}

/// Graphics buffer allocator.
///
/// Implementations must be callable from every pipeline worker.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, spec: &BufferSpec) -> Result<Allocation>;

    fn free(&self, handle: BufferHandle);

    /// Wrap a buffer allocated by someone else; the fd stays owned by the caller.
    fn import(&self, fd: RawFd, len: usize) -> Result<Allocation>;

    fn release_import(&self, handle: BufferHandle);

    /// CPU mapping used by the software transforms and the encoder.
    fn map(&self, handle: BufferHandle) -> Result<MmapMut>;

    /// Make device writes visible to the CPU and compositor.
    fn flush_cache(&self, handle: BufferHandle) -> Result<()>;
}
