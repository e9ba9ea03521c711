//! Ownership table for every buffer the pipeline allocates

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::MmapMut;
use tracing::{debug, warn};

use super::{Allocation, BufferAllocator, BufferHandle, BufferSpec};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferCategory {
    Capture,
    Signal,
    Record,
    RangeOut,
    FieldIn,
    DeinterlaceOut,
    Preview,
}

impl fmt::Display for BufferCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferCategory::Capture => "capture",
            BufferCategory::Signal => "signal",
            BufferCategory::Record => "record",
            BufferCategory::RangeOut => "range-out",
            BufferCategory::FieldIn => "field-in",
            BufferCategory::DeinterlaceOut => "deinterlace-out",
            BufferCategory::Preview => "preview",
        };
        f.write_str(name)
    }
}

type Key = (BufferCategory, usize);

struct Inner {
    allocator: Arc<dyn BufferAllocator>,
    live: Mutex<HashMap<Key, BufferHandle>>,
    released: AtomicUsize,
    serial: AtomicUsize,
}

/// Registry keyed by `(category, index)`.
///
/// Entries are handed out as [`OwnedBuffer`] guards; dropping a guard frees
/// the buffer and removes the entry, so no teardown path can leak.
#[derive(Clone)]
pub struct BufferTable {
    inner: Arc<Inner>,
}

impl BufferTable {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            inner: Arc::new(Inner {
                allocator,
                live: Mutex::new(HashMap::new()),
                released: AtomicUsize::new(0),
                serial: AtomicUsize::new(0),
            }),
        }
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.inner.allocator
    }

    pub fn allocate(
        &self,
        category: BufferCategory,
        index: usize,
        spec: &BufferSpec,
    ) -> Result<OwnedBuffer> {
        self.reserve(category, index)?;
        match self.inner.allocator.allocate(spec) {
            Ok(alloc) => Ok(self.register(category, index, alloc, false)),
            Err(e) => {
                self.unreserve(category, index);
                Err(e)
            }
        }
    }

    /// Allocate `count` buffers of one category; all or nothing.
    pub fn allocate_many(
        &self,
        category: BufferCategory,
        count: usize,
        spec: &BufferSpec,
    ) -> Result<Vec<OwnedBuffer>> {
        (0..count)
            .map(|index| self.allocate(category, index, spec))
            .collect()
    }

    /// Allocate `count` buffers under fresh indices. Used by stages that
    /// rebuild their buffers while an older set may still be in use.
    pub fn allocate_set(
        &self,
        category: BufferCategory,
        count: usize,
        spec: &BufferSpec,
    ) -> Result<Vec<OwnedBuffer>> {
        let base = self.inner.serial.fetch_add(count, Ordering::Relaxed);
        (base..base + count)
            .map(|index| self.allocate(category, index, spec))
            .collect()
    }

    pub fn import(
        &self,
        category: BufferCategory,
        index: usize,
        fd: RawFd,
        len: usize,
    ) -> Result<OwnedBuffer> {
        self.reserve(category, index)?;
        match self.inner.allocator.import(fd, len) {
            Ok(alloc) => Ok(self.register(category, index, alloc, true)),
            Err(e) => {
                self.unreserve(category, index);
                Err(e)
            }
        }
    }

    /// Buffers currently alive in one category
    pub fn live(&self, category: BufferCategory) -> usize {
        self.lock()
            .keys()
            .filter(|(cat, _)| *cat == category)
            .count()
    }

    pub fn live_total(&self) -> usize {
        self.lock().len()
    }

    /// Buffers released since the table was created
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Key, BufferHandle>> {
        // A poisoned table still holds valid bookkeeping.
        self.inner
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self, category: BufferCategory, index: usize) -> Result<()> {
        let mut live = self.lock();
        if live.contains_key(&(category, index)) {
            return Err(Error::InvalidState(format!(
                "{category} buffer {index} is already allocated"
            )));
        }
        live.insert((category, index), BufferHandle(0));
        Ok(())
    }

    fn unreserve(&self, category: BufferCategory, index: usize) {
        self.lock().remove(&(category, index));
    }

    fn register(
        &self,
        category: BufferCategory,
        index: usize,
        alloc: Allocation,
        imported: bool,
    ) -> OwnedBuffer {
        self.lock().insert((category, index), alloc.handle);
        debug!(%category, index, handle = %alloc.handle, len = alloc.len, "buffer registered");
        OwnedBuffer {
            table: self.inner.clone(),
            category,
            index,
            alloc,
            imported,
        }
    }
}

/// RAII guard for one table entry
pub struct OwnedBuffer {
    table: Arc<Inner>,
    category: BufferCategory,
    index: usize,
    alloc: Allocation,
    imported: bool,
}

impl OwnedBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.alloc.handle
    }

    pub fn fd(&self) -> RawFd {
        self.alloc.fd
    }

    pub fn len(&self) -> usize {
        self.alloc.len
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.len == 0
    }

    pub fn stride(&self) -> u32 {
        self.alloc.stride
    }

    pub fn category(&self) -> BufferCategory {
        self.category
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn map(&self) -> Result<MmapMut> {
        self.table.allocator.map(self.alloc.handle)
    }

    pub fn flush(&self) -> Result<()> {
        self.table.allocator.flush_cache(self.alloc.handle)
    }
}

impl fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedBuffer")
            .field("category", &self.category)
            .field("index", &self.index)
            .field("handle", &self.alloc.handle)
            .finish()
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if self.imported {
            self.table.allocator.release_import(self.alloc.handle);
        } else {
            self.table.allocator.free(self.alloc.handle);
        }
        let removed = self
            .table
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&(self.category, self.index));
        if removed.is_none() {
            warn!(category = %self.category, index = self.index, "buffer missing from table");
        }
        self.table.released.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferUsage;
    use crate::capture::frame::PixelFormat;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct Counting {
        next: AtomicU64,
        freed: Mutex<Vec<BufferHandle>>,
        fail_after: Option<u64>,
    }

    impl BufferAllocator for Counting {
        fn allocate(&self, spec: &BufferSpec) -> Result<Allocation> {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|limit| n > limit) {
                return Err(Error::Allocation("exhausted".into()));
            }
            Ok(Allocation {
                handle: BufferHandle(n),
                fd: -1,
                len: spec.byte_len(),
                stride: spec.stride(),
            })
        }

        fn free(&self, handle: BufferHandle) {
            self.freed.lock().unwrap().push(handle);
        }

        fn import(&self, fd: RawFd, len: usize) -> Result<Allocation> {
            Ok(Allocation {
                handle: BufferHandle(1000 + fd as u64),
                fd,
                len,
                stride: 0,
            })
        }

        fn release_import(&self, _handle: BufferHandle) {}

        fn map(&self, _handle: BufferHandle) -> Result<MmapMut> {
            Err(Error::Allocation("not mappable".into()))
        }

        fn flush_cache(&self, _handle: BufferHandle) -> Result<()> {
            Ok(())
        }
    }

    fn spec() -> BufferSpec {
        BufferSpec::new(64, 32, PixelFormat::Nv12, BufferUsage::CAPTURE)
    }

    #[test]
    fn dropping_guards_frees_and_counts() {
        let alloc = Arc::new(Counting::default());
        let table = BufferTable::new(alloc.clone());
        let bufs = table
            .allocate_many(BufferCategory::Capture, 3, &spec())
            .unwrap();
        assert_eq!(table.live(BufferCategory::Capture), 3);
        assert_eq!(bufs[0].len(), 64 * 32 * 3 / 2);

        drop(bufs);
        assert_eq!(table.live_total(), 0);
        assert_eq!(table.released(), 3);
        assert_eq!(alloc.freed.lock().unwrap().len(), 3);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let table = BufferTable::new(Arc::new(Counting::default()));
        let _first = table.allocate(BufferCategory::Record, 0, &spec()).unwrap();
        assert!(matches!(
            table.allocate(BufferCategory::Record, 0, &spec()),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(table.live(BufferCategory::Record), 1);
    }

    #[test]
    fn sets_never_collide() {
        let table = BufferTable::new(Arc::new(Counting::default()));
        let old = table
            .allocate_set(BufferCategory::FieldIn, 3, &spec())
            .unwrap();
        let new = table
            .allocate_set(BufferCategory::FieldIn, 3, &spec())
            .unwrap();
        assert_eq!(table.live(BufferCategory::FieldIn), 6);
        assert_ne!(old[0].index(), new[0].index());
        drop(old);
        assert_eq!(table.live(BufferCategory::FieldIn), 3);
    }

    #[test]
    fn failed_batch_releases_partial_allocations() {
        let alloc = Arc::new(Counting {
            fail_after: Some(2),
            ..Default::default()
        });
        let table = BufferTable::new(alloc.clone());
        assert!(table
            .allocate_many(BufferCategory::Capture, 4, &spec())
            .is_err());
        assert_eq!(table.live_total(), 0);
        assert_eq!(alloc.freed.lock().unwrap().len(), 2);
    }
}
