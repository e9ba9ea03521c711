//! Kernel buffer queue ownership

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::buffer::{BufferCategory, BufferHandle, BufferSpec, BufferTable, BufferUsage, OwnedBuffer};
use crate::capture::device::CaptureDevice;
use crate::capture::frame::{CapturedFrame, Geometry, PixelFormat};
use crate::error::{Error, Result};

const FREE: u8 = 0;
const KERNEL_OWNED: u8 = 1;
const APP_OWNED: u8 = 2;

/// Fewest buffers a capture stream can run with
pub const MIN_BUFFERS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    KernelOwned,
    AppOwned,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            KERNEL_OWNED => SlotState::KernelOwned,
            APP_OWNED => SlotState::AppOwned,
            _ => SlotState::Free,
        }
    }
}

/// One kernel buffer index bound to its backing graphics buffer
#[derive(Debug)]
pub struct CaptureSlot {
    pub index: u32,
    pub handle: BufferHandle,
    pub fd: RawFd,
    pub length: u32,
    state: AtomicU8,
}

impl CaptureSlot {
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub stride_align: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    /// Requeues after the initial fill
    pub queued: u64,
    pub dequeued: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum Dequeue {
    Ready(CapturedFrame),
    Timeout,
}

/// Owns every capture slot and the kernel queue for one streaming session
pub struct CaptureQueue {
    device: Arc<dyn CaptureDevice>,
    slots: Vec<CaptureSlot>,
    buffers: Mutex<Vec<OwnedBuffer>>,
    geometry: Geometry,
    format: PixelFormat,
    stopped: AtomicBool,
    sequence: AtomicU64,
    queued: AtomicU64,
    dequeued: AtomicU64,
    errors: AtomicU64,
}

impl CaptureQueue {
    /// Negotiate, allocate and queue every buffer, then start streaming.
    ///
    /// On failure nothing is left behind: buffers are freed and the kernel
    /// queue is reset to zero.
    #[instrument(skip(device, table))]
    pub fn start(
        device: Arc<dyn CaptureDevice>,
        table: &BufferTable,
        params: &QueueParams,
    ) -> Result<Self> {
        let caps = device.query_caps()?;
        debug!(driver = %caps.driver, multiplanar = caps.multiplanar, "capture caps");

        let granted = device.request_buffers(params.buffer_count)?;
        if granted < MIN_BUFFERS {
            Self::reset_kernel_queue(device.as_ref());
            return Err(Error::Allocation(format!(
                "driver granted {granted} of {} capture buffers",
                params.buffer_count
            )));
        }
        if granted != params.buffer_count {
            info!("driver granted {} of {} capture buffers", granted, params.buffer_count);
        }

        let spec = BufferSpec::new(
            params.width,
            params.height,
            params.format,
            BufferUsage::CAPTURE | BufferUsage::COMPOSER | BufferUsage::CPU_READ,
        )
        .stride_align(params.stride_align);

        let buffers = match table.allocate_many(BufferCategory::Capture, granted as usize, &spec) {
            Ok(buffers) => buffers,
            Err(e) => {
                Self::reset_kernel_queue(device.as_ref());
                return Err(e);
            }
        };

        match Self::bring_up(device.as_ref(), &buffers) {
            Ok(slots) => {
                info!(
                    "Capture streaming {}x{} {:?} with {} buffers",
                    params.width, params.height, params.format, granted
                );
                Ok(Self {
                    device,
                    slots,
                    buffers: Mutex::new(buffers),
                    geometry: Geometry::with_stride_align(
                        params.width,
                        params.height,
                        params.stride_align,
                    ),
                    format: params.format,
                    stopped: AtomicBool::new(false),
                    sequence: AtomicU64::new(0),
                    queued: AtomicU64::new(0),
                    dequeued: AtomicU64::new(0),
                    errors: AtomicU64::new(0),
                })
            }
            Err(e) => {
                drop(buffers);
                Self::reset_kernel_queue(device.as_ref());
                Err(e)
            }
        }
    }

    fn bring_up(device: &dyn CaptureDevice, buffers: &[OwnedBuffer]) -> Result<Vec<CaptureSlot>> {
        let mut slots = Vec::with_capacity(buffers.len());
        for (i, buffer) in buffers.iter().enumerate() {
            let kbuf = device.query_buffer(i as u32)?;
            let length = if kbuf.length > 0 {
                kbuf.length
            } else {
                buffer.len() as u32
            };
            slots.push(CaptureSlot {
                index: kbuf.index,
                handle: buffer.handle(),
                fd: buffer.fd(),
                length,
                state: AtomicU8::new(FREE),
            });
        }
        for slot in &slots {
            device.queue(slot.index, slot.fd, slot.length)?;
            slot.state.store(KERNEL_OWNED, Ordering::Release);
        }
        device.stream_on()?;
        Ok(slots)
    }

    fn reset_kernel_queue(device: &dyn CaptureDevice) {
        if let Err(e) = device.request_buffers(0) {
            warn!("failed to release kernel buffer queue: {}", e);
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: usize) -> Option<&CaptureSlot> {
        self.slots.get(index)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for a filled buffer.
    pub fn dequeue(&self, timeout: Duration) -> Result<Dequeue> {
        if self.is_stopped() {
            return Err(Error::NotStreaming);
        }
        match self.device.wait_readable(timeout) {
            Ok(true) => {}
            Ok(false) => return Ok(Dequeue::Timeout),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }

        let dq = match self.device.dequeue() {
            Ok(dq) => dq,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let slot = self.slots.get(dq.index as usize).ok_or_else(|| {
            self.errors.fetch_add(1, Ordering::Relaxed);
            Error::InvalidState(format!("driver returned unknown buffer {}", dq.index))
        })?;
        if !slot.transition(KERNEL_OWNED, APP_OWNED) {
            warn!(slot = dq.index, state = ?slot.state(), "dequeued a slot the kernel did not own");
            slot.state.store(APP_OWNED, Ordering::Release);
        }

        self.dequeued.fetch_add(1, Ordering::Relaxed);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        Ok(Dequeue::Ready(CapturedFrame {
            slot: dq.index as usize,
            handle: slot.handle,
            fd: slot.fd,
            sequence,
            bytes_used: dq.bytes_used,
            timestamp: Instant::now(),
        }))
    }

    /// Return a dequeued slot to the kernel. Exactly once per dequeue.
    pub fn requeue(&self, index: usize) -> Result<()> {
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no capture slot {index}")))?;
        if !slot.transition(APP_OWNED, KERNEL_OWNED) {
            return Err(Error::InvalidState(format!(
                "capture slot {index} is {:?}, not application-owned",
                slot.state()
            )));
        }
        if let Err(e) = self.device.queue(slot.index, slot.fd, slot.length) {
            slot.state.store(APP_OWNED, Ordering::Release);
            self.errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            queued: self.queued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Slots currently held by the application
    pub fn app_owned(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() == SlotState::AppOwned)
            .count()
    }

    /// Tear the stream down and free every backing buffer.
    ///
    /// Never fails: device errors are logged and teardown continues.
    /// Returns the number of buffers released, zero on a repeated call.
    #[instrument(skip(self))]
    pub fn stop(&self) -> usize {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }

        for slot in self.slots.iter().filter(|s| s.state() == SlotState::AppOwned) {
            debug!(slot = slot.index, "returning outstanding slot before stream-off");
            if let Err(e) = self.requeue(slot.index as usize) {
                warn!("requeue of slot {} failed during stop: {}", slot.index, e);
            }
        }

        if let Err(e) = self.device.stream_off() {
            warn!("stream-off failed: {}", e);
        }
        Self::reset_kernel_queue(self.device.as_ref());

        for slot in &self.slots {
            slot.state.store(FREE, Ordering::Release);
        }
        let released = {
            let mut buffers = self
                .buffers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let n = buffers.len();
            buffers.clear();
            n
        };
        info!("Capture stopped, released {} buffers", released);
        released
    }
}

impl Drop for CaptureQueue {
    fn drop(&mut self) {
        self.stop();
    }
}
