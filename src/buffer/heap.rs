//! DMA-heap backed allocator with a memfd fallback

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};

use super::{Allocation, BufferAllocator, BufferHandle, BufferSpec};
use crate::error::{Error, Result};

const DMA_HEAP_PATH: &str = "/dev/dma_heap/system";

#[repr(C)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

const DMA_BUF_SYNC_RW: u64 = 3;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 4;

nix::ioctl_readwrite!(dma_heap_alloc, b'H', 0x0, DmaHeapAllocationData);
nix::ioctl_write_ptr!(dma_buf_sync, b'b', 0, DmaBufSync);

enum Backing {
    DmaBuf(File),
    Memfd(File),
    Imported(RawFd),
}

impl Backing {
    fn fd(&self) -> RawFd {
        match self {
            Backing::DmaBuf(file) | Backing::Memfd(file) => file.as_raw_fd(),
            Backing::Imported(fd) => *fd,
        }
    }
}

struct Entry {
    backing: Backing,
    len: usize,
}

/// Allocates shareable buffers from the system DMA heap.
///
/// Hosts without `/dev/dma_heap` get anonymous memfd buffers instead, which
/// the software transforms handle the same way but a capture driver cannot
/// import.
pub struct HeapAllocator {
    heap: Option<File>,
    entries: Mutex<HashMap<BufferHandle, Entry>>,
    next: AtomicU64,
}

impl HeapAllocator {
    pub fn new() -> Self {
        let heap = match OpenOptions::new().read(true).write(true).open(DMA_HEAP_PATH) {
            Ok(file) => {
                info!("Allocating buffers from {}", DMA_HEAP_PATH);
                Some(file)
            }
            Err(e) => {
                warn!("{} unavailable ({}), falling back to memfd", DMA_HEAP_PATH, e);
                None
            }
        };
        Self::with_heap(heap)
    }

    pub fn memfd_only() -> Self {
        Self::with_heap(None)
    }

    pub fn with_heap_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::with_heap(Some(file)))
    }

    fn with_heap(heap: Option<File>) -> Self {
        Self {
            heap,
            entries: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<BufferHandle, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn alloc_dmabuf(heap: &File, len: usize) -> Result<File> {
        let mut data = DmaHeapAllocationData {
            len: len as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        unsafe { dma_heap_alloc(heap.as_raw_fd(), &mut data) }
            .map_err(|e| Error::errno("DMA_HEAP_IOCTL_ALLOC", e))?;
        // The heap hands back a new descriptor that we now own.
        Ok(unsafe { File::from_raw_fd(data.fd as RawFd) })
    }

    fn alloc_memfd(len: usize) -> Result<File> {
        let name = CString::new("hdmirx-buffer")
            .map_err(|e| Error::Allocation(e.to_string()))?;
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::device("memfd_create", std::io::Error::last_os_error()));
        }
        let file = File::from(unsafe { OwnedFd::from_raw_fd(raw) });
        file.set_len(len as u64)?;
        Ok(file)
    }

    fn next_handle(&self) -> BufferHandle {
        BufferHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, spec: &BufferSpec) -> Result<Allocation> {
        let len = crate::utils::align_up_usize(spec.byte_len(), page_size::get());
        if len == 0 {
            return Err(Error::InvalidArgument(format!("empty buffer spec {spec:?}")));
        }

        let backing = match &self.heap {
            Some(heap) => Backing::DmaBuf(Self::alloc_dmabuf(heap, len)?),
            None => Backing::Memfd(Self::alloc_memfd(len)?),
        };
        let handle = self.next_handle();
        let fd = backing.fd();
        self.entries().insert(handle, Entry { backing, len });

        debug!(%handle, fd, len, format = ?spec.format, "allocated buffer");
        Ok(Allocation {
            handle,
            fd,
            len,
            stride: spec.stride(),
        })
    }

    fn free(&self, handle: BufferHandle) {
        // Dropping the entry closes the descriptor.
        if self.entries().remove(&handle).is_none() {
            warn!(%handle, "free of unknown buffer");
        }
    }

    fn import(&self, fd: RawFd, len: usize) -> Result<Allocation> {
        if fd < 0 {
            return Err(Error::InvalidArgument(format!("bad import fd {fd}")));
        }
        let handle = self.next_handle();
        self.entries().insert(
            handle,
            Entry {
                backing: Backing::Imported(fd),
                len,
            },
        );
        Ok(Allocation {
            handle,
            fd,
            len,
            stride: 0,
        })
    }

    fn release_import(&self, handle: BufferHandle) {
        self.entries().remove(&handle);
    }

    fn map(&self, handle: BufferHandle) -> Result<MmapMut> {
        let (fd, len) = {
            let entries = self.entries();
            let entry = entries
                .get(&handle)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown buffer {handle}")))?;
            (entry.backing.fd(), entry.len)
        };
        let map = unsafe { MmapOptions::new().len(len).map_mut(fd) }?;
        Ok(map)
    }

    fn flush_cache(&self, handle: BufferHandle) -> Result<()> {
        let fd = match self.entries().get(&handle) {
            Some(Entry {
                backing: Backing::DmaBuf(file),
                ..
            }) => file.as_raw_fd(),
            Some(_) => return Ok(()),
            None => return Err(Error::InvalidArgument(format!("unknown buffer {handle}"))),
        };
        for flags in [
            DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW,
            DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW,
        ] {
            let sync = DmaBufSync { flags };
            unsafe { dma_buf_sync(fd, &sync) }
                .map_err(|e| Error::errno("DMA_BUF_IOCTL_SYNC", e))?;
        }
        Ok(())
    }
}
