//! In-process stand-ins for the driver, allocator, transform units and sinks

#![allow(dead_code)]

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use memmap2::MmapMut;

use hdmirx::buffer::{Allocation, BufferAllocator, BufferHandle, BufferSpec};
use hdmirx::capture::device::{DeviceCaps, DequeuedBuffer, KernelBuffer};
use hdmirx::capture::{CaptureDevice, CropRect, DeviceFormat, ExtInfo, PixelFormat};
use hdmirx::display::{CaptureNotifier, DisplaySink, SourceType};
use hdmirx::encode::{EncodeSink, EncoderFactory, EncoderMeta, RecordFrame, RecordSlots};
use hdmirx::transform::{
    BlitEngine, DeinterlaceContext, DeinterlaceEngine, Image, RangeContext, RangeEngine,
    RangeReport, StageParams,
};
use hdmirx::{Collaborators, Config, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Show(BufferHandle, SourceType),
    Clear,
    RangeInit,
    Range {
        src: BufferHandle,
        dst: Option<BufferHandle>,
    },
    Deinterlace {
        fields: [BufferHandle; 3],
        outputs: [BufferHandle; 2],
    },
    Notify(u64, BufferHandle),
}

/// Ordered record of everything the pipeline asked the collaborators to do
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn shows(&self) -> Vec<BufferHandle> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                Event::Show(h, SourceType::Capture) => Some(h),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| f(e)).count()
    }
}

/// Poll `f` until it holds or two seconds pass.
pub fn wait_for(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct DeviceState {
    /// Indices owned by the driver, in queue order
    queued: VecDeque<u32>,
    /// Frames the "source" has produced but nobody dequeued yet
    pending: usize,
    streaming: bool,
    sequence: u32,
    format: Option<DeviceFormat>,
    crop: CropRect,
    rotation: u32,
    frame_rate: u32,
    ops: Vec<String>,
}

/// A capture node that fills buffers only when the test feeds frames
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<DeviceState>,
    ready: Condvar,
    pub fail_stream_on: AtomicBool,
    pub fail_poll: AtomicBool,
    pub interlaced: AtomicBool,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    /// Make `n` more frames available to dequeue.
    pub fn feed(&self, n: usize) {
        self.lock().pending += n;
        self.ready.notify_all();
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn queued(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    fn default_format(&self) -> DeviceFormat {
        DeviceFormat {
            width: 64,
            height: 32,
            format: PixelFormat::Nv12,
            interlaced: self.interlaced.load(Ordering::Relaxed),
        }
    }
}

impl CaptureDevice for MockDevice {
    fn query_caps(&self) -> Result<DeviceCaps> {
        Ok(DeviceCaps {
            driver: "mock".into(),
            card: "mock hdmi".into(),
            multiplanar: true,
        })
    }

    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut state = self.lock();
        state.ops.push(format!("reqbufs {count}"));
        if count == 0 {
            state.queued.clear();
        }
        Ok(count)
    }

    fn query_buffer(&self, index: u32) -> Result<KernelBuffer> {
        Ok(KernelBuffer { index, length: 0 })
    }

    fn queue(&self, index: u32, _fd: RawFd, _length: u32) -> Result<()> {
        let mut state = self.lock();
        if state.queued.contains(&index) {
            return Err(Error::InvalidState(format!("buffer {index} queued twice")));
        }
        state.queued.push_back(index);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        if self.fail_poll.load(Ordering::Relaxed) {
            return Err(Error::InvalidState("poll failed".into()));
        }
        let timeout = timeout.min(Duration::from_millis(5));
        let state = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |s| {
                !(s.streaming && s.pending > 0 && !s.queued.is_empty())
            })
            .unwrap();
        Ok(state.streaming && state.pending > 0 && !state.queued.is_empty())
    }

    fn dequeue(&self) -> Result<DequeuedBuffer> {
        let mut state = self.lock();
        if state.pending == 0 {
            return Err(Error::InvalidState("nothing to dequeue".into()));
        }
        let index = state
            .queued
            .pop_front()
            .ok_or_else(|| Error::InvalidState("no queued buffer".into()))?;
        state.pending -= 1;
        state.sequence += 1;
        Ok(DequeuedBuffer {
            index,
            bytes_used: 0,
            sequence: state.sequence,
        })
    }

    fn stream_on(&self) -> Result<()> {
        let mut state = self.lock();
        state.ops.push("streamon".into());
        if self.fail_stream_on.load(Ordering::Relaxed) {
            return Err(Error::InvalidState("stream-on refused".into()));
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<()> {
        let mut state = self.lock();
        state.ops.push("streamoff".into());
        state.streaming = false;
        Ok(())
    }

    fn enum_formats(&self) -> Result<Vec<PixelFormat>> {
        Ok(vec![PixelFormat::Nv12, PixelFormat::Bgr24])
    }

    fn try_format(&self, format: &DeviceFormat) -> Result<DeviceFormat> {
        Ok(*format)
    }

    fn get_format(&self) -> Result<DeviceFormat> {
        let stored = self.lock().format;
        Ok(stored.unwrap_or_else(|| self.default_format()))
    }

    fn set_format(&self, format: &DeviceFormat) -> Result<DeviceFormat> {
        let applied = DeviceFormat {
            interlaced: self.interlaced.load(Ordering::Relaxed),
            ..*format
        };
        self.lock().format = Some(applied);
        Ok(applied)
    }

    fn get_crop(&self) -> Result<CropRect> {
        Ok(self.lock().crop)
    }

    fn set_crop(&self, rect: CropRect) -> Result<()> {
        self.lock().crop = rect;
        Ok(())
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        self.lock().frame_rate = fps;
        Ok(())
    }

    fn set_rotation(&self, degrees: u32) -> Result<()> {
        self.lock().rotation = degrees;
        Ok(())
    }

    fn ext_info(&self) -> Result<ExtInfo> {
        Ok(ExtInfo {
            fps: 60,
            ..Default::default()
        })
    }
}

/// Allocator handing out numbered handles with no backing memory
#[derive(Default)]
pub struct MockAllocator {
    next: AtomicU64,
    pub allocated: AtomicUsize,
    pub freed: AtomicUsize,
    pub fail_after: Mutex<Option<usize>>,
}

impl MockAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl BufferAllocator for MockAllocator {
    fn allocate(&self, spec: &BufferSpec) -> Result<Allocation> {
        let n = self.allocated.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_after.lock().unwrap().is_some_and(|limit| n > limit) {
            self.allocated.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Allocation("mock heap exhausted".into()));
        }
        Ok(Allocation {
            handle: BufferHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1),
            fd: -1,
            len: spec.byte_len(),
            stride: spec.stride(),
        })
    }

    fn free(&self, _handle: BufferHandle) {
        self.freed.fetch_add(1, Ordering::SeqCst);
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
        Err(Error::Allocation("mock buffers are not mappable".into()))
    }

    fn flush_cache(&self, _handle: BufferHandle) -> Result<()> {
        Ok(())
    }
}

pub struct MockRange {
    pub log: EventLog,
    pub inits: AtomicUsize,
}

struct MockRangeContext {
    log: EventLog,
}

impl RangeEngine for MockRange {
    fn init(&self, _params: &StageParams) -> Result<Box<dyn RangeContext>> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.log.push(Event::RangeInit);
        Ok(Box::new(MockRangeContext {
            log: self.log.clone(),
        }))
    }
}

impl RangeContext for MockRangeContext {
    fn transform(&mut self, src: &Image, dst: Option<&Image>) -> Result<RangeReport> {
        self.log.push(Event::Range {
            src: src.handle,
            dst: dst.map(|d| d.handle),
        });
        Ok(RangeReport {
            mean_luma: Some(100),
        })
    }
}

pub struct MockDeinterlace {
    pub log: EventLog,
    /// Milliseconds each transform takes after it is logged
    pub delay_ms: Arc<AtomicU64>,
}

struct MockDeinterlaceContext {
    log: EventLog,
    delay_ms: Arc<AtomicU64>,
}

impl DeinterlaceEngine for MockDeinterlace {
    fn init(&self, _params: &StageParams) -> Result<Box<dyn DeinterlaceContext>> {
        Ok(Box::new(MockDeinterlaceContext {
            log: self.log.clone(),
            delay_ms: self.delay_ms.clone(),
        }))
    }
}

impl DeinterlaceContext for MockDeinterlaceContext {
    fn transform(&mut self, fields: [&Image; 3], outputs: [&Image; 2]) -> Result<()> {
        self.log.push(Event::Deinterlace {
            fields: fields.map(|f| f.handle),
            outputs: outputs.map(|o| o.handle),
        });
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        Ok(())
    }
}

pub struct MockBlit;

impl BlitEngine for MockBlit {
    fn blit(&self, _src: &Image, _dst: &Image) -> Result<()> {
        Ok(())
    }
}

pub struct MockDisplay {
    pub log: EventLog,
}

impl DisplaySink for MockDisplay {
    fn show(&self, handle: BufferHandle, _ratio: u32, source: SourceType) -> Result<()> {
        self.log.push(Event::Show(handle, source));
        Ok(())
    }

    fn clear_area(&self) -> Result<()> {
        self.log.push(Event::Clear);
        Ok(())
    }

    fn queue_tunnel(&self, handle: BufferHandle) -> Result<()> {
        self.log.push(Event::Show(handle, SourceType::Capture));
        Ok(())
    }

    fn dequeue_tunnel(&self, _timeout: Duration) -> Result<Option<BufferHandle>> {
        Ok(None)
    }
}

pub struct MockNotifier {
    pub log: EventLog,
}

impl CaptureNotifier for MockNotifier {
    fn capture_complete(&self, buffer_id: u64, handle: BufferHandle) {
        self.log.push(Event::Notify(buffer_id, handle));
    }
}

/// Encoder that hands every slot straight back
#[derive(Default)]
pub struct MockEncoder {
    slots: Mutex<Option<RecordSlots>>,
    pub frames: AtomicUsize,
    pub frame_size: AtomicUsize,
    pub stopped: AtomicBool,
}

impl EncodeSink for MockEncoder {
    fn init(&self, _meta: &EncoderMeta, slots: RecordSlots) -> Result<()> {
        *self.slots.lock().unwrap() = Some(slots);
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn send_frame(&self, frame: RecordFrame, _flags: u32) -> bool {
        self.frames.fetch_add(1, Ordering::SeqCst);
        self.frame_size.store(frame.size, Ordering::SeqCst);
        if let Some(slots) = &*self.slots.lock().unwrap() {
            slots.release(frame.index);
        }
        true
    }
}

#[derive(Default)]
pub struct MockEncoderFactory {
    pub last: Mutex<Option<Arc<MockEncoder>>>,
}

impl EncoderFactory for MockEncoderFactory {
    fn create(&self) -> Result<Arc<dyn EncodeSink>> {
        let encoder = Arc::new(MockEncoder::default());
        *self.last.lock().unwrap() = Some(encoder.clone());
        Ok(encoder)
    }
}

/// Everything a scenario needs to drive and observe a pipeline
pub struct Harness {
    pub device: Arc<MockDevice>,
    pub allocator: Arc<MockAllocator>,
    pub encoder: Arc<MockEncoderFactory>,
    pub deinterlace_delay_ms: Arc<AtomicU64>,
    pub log: EventLog,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            device: MockDevice::new(),
            allocator: MockAllocator::new(),
            encoder: Arc::new(MockEncoderFactory::default()),
            deinterlace_delay_ms: Arc::new(AtomicU64::new(0)),
            log: EventLog::default(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            device: self.device.clone(),
            allocator: self.allocator.clone(),
            display: Arc::new(MockDisplay {
                log: self.log.clone(),
            }),
            notifier: Arc::new(MockNotifier {
                log: self.log.clone(),
            }),
            range: Arc::new(MockRange {
                log: self.log.clone(),
                inits: AtomicUsize::new(0),
            }),
            deinterlace: Arc::new(MockDeinterlace {
                log: self.log.clone(),
                delay_ms: self.deinterlace_delay_ms.clone(),
            }),
            blit: Arc::new(MockBlit),
            encoder: self.encoder.clone(),
        }
    }
}

/// Small, fast-polling configuration for in-process runs
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.width = 64;
    config.capture.height = 32;
    config.capture.buffer_count = 4;
    config.pipeline.dequeue_timeout_ms = 5;
    config.pipeline.idle_poll_us = 200;
    config.pipeline.stride_align = 16;
    config
}
