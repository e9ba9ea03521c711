//! Recording sink: record ring management and the encoder contract

pub mod file;

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::buffer::{BufferCategory, BufferHandle, BufferSpec, BufferTable, BufferUsage, OwnedBuffer};
use crate::capture::frame::{Geometry, PixelFormat};
use crate::error::Result;
use crate::transform::{BlitEngine, Image};

pub use file::{FileEncoder, FileEncoderFactory};

/// Port handed to network-capable encoders
pub const DEFAULT_ENCODER_PORT: u16 = 1234;
/// Frame rate assumed when the receiver reports none
pub const FALLBACK_FPS: u32 = 60;
/// Row alignment of record ring buffers, in pixels
const RECORD_STRIDE_ALIGN: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderMeta {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub port: u16,
    pub path: PathBuf,
}

/// One filled record slot handed to the encoder
#[derive(Debug, Clone, Copy)]
pub struct RecordFrame {
    pub index: usize,
    pub handle: BufferHandle,
    pub fd: RawFd,
    pub size: usize,
    pub timestamp: Instant,
}

/// In-flight flags of the record ring. Encoders call [`RecordSlots::release`]
/// once they are done with a slot.
#[derive(Clone)]
pub struct RecordSlots {
    in_flight: Arc<[AtomicBool]>,
}

impl RecordSlots {
    pub fn new(count: usize) -> Self {
        Self {
            in_flight: (0..count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Claim a slot; false if the encoder still holds it.
    pub fn acquire(&self, index: usize) -> bool {
        self.in_flight.get(index).is_some_and(|flag| {
            flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    pub fn release(&self, index: usize) {
        if let Some(flag) = self.in_flight.get(index) {
            flag.store(false, Ordering::Release);
        }
    }

    pub fn is_in_flight(&self, index: usize) -> bool {
        self.in_flight
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }
}

impl fmt::Debug for RecordSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSlots")
            .field("capacity", &self.in_flight.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

pub trait EncodeSink: Send + Sync {
    fn init(&self, meta: &EncoderMeta, slots: RecordSlots) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self);

    /// Queue one frame. On `false` the caller keeps ownership of the slot.
    fn send_frame(&self, frame: RecordFrame, flags: u32) -> bool;
}

pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn EncodeSink>>;
}

/// An active recording: NV12 record ring plus the encoder feeding on it
pub struct RecordSession {
    buffers: Vec<OwnedBuffer>,
    geometry: Geometry,
    /// Bytes of one NV12 record frame at the aligned stride
    frame_size: usize,
    cursor: AtomicUsize,
    slots: RecordSlots,
    encoder: Arc<dyn EncodeSink>,
    meta: EncoderMeta,
}

impl RecordSession {
    pub fn open(
        table: &BufferTable,
        factory: &dyn EncoderFactory,
        meta: EncoderMeta,
        ring_size: usize,
    ) -> Result<Self> {
        let spec = BufferSpec::new(
            meta.width,
            meta.height,
            PixelFormat::Nv12,
            BufferUsage::ENCODER | BufferUsage::TRANSFORM | BufferUsage::CPU_READ,
        )
        .stride_align(RECORD_STRIDE_ALIGN);
        let frame_size = spec.byte_len();
        let buffers = table.allocate_set(BufferCategory::Record, ring_size, &spec)?;
        let slots = RecordSlots::new(buffers.len());

        let encoder = factory.create()?;
        encoder.init(&meta, slots.clone())?;
        encoder.start()?;

        info!(
            "Recording {}x{}@{} to {}",
            meta.width,
            meta.height,
            meta.fps,
            meta.path.display()
        );
        Ok(Self {
            buffers,
            geometry: Geometry::with_stride_align(meta.width, meta.height, RECORD_STRIDE_ALIGN),
            frame_size,
            cursor: AtomicUsize::new(0),
            slots,
            encoder,
            meta,
        })
    }

    pub fn meta(&self) -> &EncoderMeta {
        &self.meta
    }

    pub fn slots(&self) -> &RecordSlots {
        &self.slots
    }

    /// Transcode `src` into the next record slot and hand it to the encoder.
    /// Returns false when the slot is still in flight or the encoder refused.
    pub fn submit(&self, blit: &dyn BlitEngine, src: &Image, timestamp: Instant) -> bool {
        let index = self.cursor.load(Ordering::Relaxed);
        let Some(buffer) = self.buffers.get(index) else {
            return false;
        };
        if !self.slots.acquire(index) {
            debug!(index, "record slot still in flight");
            counter!("hdmirx_record_dropped").increment(1);
            return false;
        }

        let dst = Image {
            handle: buffer.handle(),
            fd: buffer.fd(),
            geometry: self.geometry,
            format: PixelFormat::Nv12,
        };
        if let Err(e) = blit.blit(src, &dst) {
            warn!("record transcode failed: {}", e);
            self.slots.release(index);
            return false;
        }

        let frame = RecordFrame {
            index,
            handle: buffer.handle(),
            fd: buffer.fd(),
            size: self.frame_size,
            timestamp,
        };
        if !self.encoder.send_frame(frame, 0) {
            self.slots.release(index);
            counter!("hdmirx_record_dropped").increment(1);
            return false;
        }
        self.cursor
            .store((index + 1) % self.buffers.len(), Ordering::Relaxed);
        counter!("hdmirx_frames_recorded").increment(1);
        true
    }
}

impl Drop for RecordSession {
    fn drop(&mut self) {
        self.encoder.stop();
        info!("Recording to {} stopped", self.meta.path.display());
    }
}
