//! Routing of finished frames to display, buffer producers and the encoder

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::atomic::AtomicCell;
use metrics::counter;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::{debug, warn};

use super::{CaptureNotifier, DisplaySink, SourceType};
use crate::buffer::{BufferCategory, BufferHandle, BufferTable, OwnedBuffer};
use crate::capture::frame::{Geometry, PixelFormat};
use crate::encode::RecordSession;
use crate::error::Result;
use crate::pipeline::session::Topology;
use crate::transform::{BlitEngine, Image};

/// Keeps at most [`TunnelPresenter::MAX_QUEUED`] buffers with the compositor
pub struct TunnelPresenter {
    queued: HeapRb<BufferHandle>,
}

impl TunnelPresenter {
    pub const MAX_QUEUED: usize = 2;
    const RECLAIM_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn new() -> Self {
        Self {
            queued: HeapRb::new(Self::MAX_QUEUED + 2),
        }
    }

    pub fn present(&mut self, display: &dyn DisplaySink, handle: BufferHandle) -> Result<()> {
        display.queue_tunnel(handle)?;
        if self.queued.is_full() {
            self.queued.try_pop();
        }
        let _ = self.queued.try_push(handle);

        if self.queued.occupied_len() > Self::MAX_QUEUED {
            match display.dequeue_tunnel(Self::RECLAIM_TIMEOUT)? {
                Some(released) => {
                    self.queued.try_pop();
                    debug!(%released, "tunnel buffer reclaimed");
                }
                None => warn!("tunnel reclaim timed out"),
            }
        }
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.queued.occupied_len()
    }

    pub fn clear(&mut self) {
        self.queued.clear();
    }
}

impl Default for TunnelPresenter {
    fn default() -> Self {
        Self::new()
    }
}

struct PreviewEntry {
    buffer_id: u64,
    buffer: OwnedBuffer,
    geometry: Geometry,
    format: PixelFormat,
    filled: bool,
}

#[derive(Default)]
struct PreviewState {
    entries: Vec<PreviewEntry>,
    cursor: usize,
    last: Option<(u64, BufferHandle)>,
}

/// Client-supplied buffers for the buffer-producer topology
#[derive(Default)]
pub struct PreviewPool {
    state: Mutex<PreviewState>,
}

impl PreviewPool {
    fn lock(&self) -> std::sync::MutexGuard<'_, PreviewState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Import a client buffer. Registering an id again replaces the old one.
    pub fn register(
        &self,
        table: &BufferTable,
        buffer_id: u64,
        fd: std::os::fd::RawFd,
        len: usize,
        geometry: Geometry,
        format: PixelFormat,
    ) -> Result<BufferHandle> {
        let mut state = self.lock();
        if let Some(pos) = state.entries.iter().position(|e| e.buffer_id == buffer_id) {
            state.entries.remove(pos);
            state.cursor = 0;
        }
        let buffer = table.import(BufferCategory::Preview, buffer_id as usize, fd, len)?;
        let handle = buffer.handle();
        state.entries.push(PreviewEntry {
            buffer_id,
            buffer,
            geometry,
            format,
            filled: false,
        });
        Ok(handle)
    }

    /// Blit `src` into the next free preview buffer.
    pub fn deliver(&self, blit: &dyn BlitEngine, src: &Image) -> Option<(u64, BufferHandle)> {
        let mut state = self.lock();
        if state.entries.is_empty() {
            return None;
        }
        let cursor = state.cursor % state.entries.len();
        let entry = &mut state.entries[cursor];
        if entry.filled {
            return None;
        }
        let dst = Image {
            handle: entry.buffer.handle(),
            fd: entry.buffer.fd(),
            geometry: entry.geometry,
            format: entry.format,
        };
        if let Err(e) = blit.blit(src, &dst) {
            warn!("preview blit failed: {}", e);
            return None;
        }
        entry.filled = true;
        let done = (entry.buffer_id, dst.handle);
        state.cursor = (cursor + 1) % state.entries.len();
        state.last = Some(done);
        Some(done)
    }

    /// The client handed `buffer_id` back for reuse.
    pub fn release(&self, buffer_id: u64) -> bool {
        let mut state = self.lock();
        match state.entries.iter_mut().find(|e| e.buffer_id == buffer_id) {
            Some(entry) => {
                entry.filled = false;
                true
            }
            None => false,
        }
    }

    pub fn last(&self) -> Option<(u64, BufferHandle)> {
        self.lock().last
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registration; returns how many were released.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.entries.len();
        *state = PreviewState::default();
        n
    }
}

/// Hands finished frames to the sink that matches the stream topology
pub struct SinkDispatcher {
    display: Arc<dyn DisplaySink>,
    notifier: Arc<dyn CaptureNotifier>,
    blit: Arc<dyn BlitEngine>,
    topology: AtomicCell<Topology>,
    ratio: AtomicU32,
    running: AtomicBool,
    tunnel: Mutex<TunnelPresenter>,
    preview: PreviewPool,
    record: ArcSwapOption<RecordSession>,
    shown: AtomicU64,
}

impl SinkDispatcher {
    pub fn new(
        display: Arc<dyn DisplaySink>,
        notifier: Arc<dyn CaptureNotifier>,
        blit: Arc<dyn BlitEngine>,
    ) -> Self {
        Self {
            display,
            notifier,
            blit,
            topology: AtomicCell::new(Topology::default()),
            ratio: AtomicU32::new(0),
            running: AtomicBool::new(false),
            tunnel: Mutex::new(TunnelPresenter::new()),
            preview: PreviewPool::default(),
            record: ArcSwapOption::const_empty(),
            shown: AtomicU64::new(0),
        }
    }

    pub fn configure(&self, topology: Topology, ratio: u32) {
        self.topology.store(topology);
        self.ratio.store(ratio, Ordering::Relaxed);
        self.tunnel.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn topology(&self) -> Topology {
        self.topology.load()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_display_ratio(&self, ratio: u32) {
        self.ratio.store(ratio, Ordering::Relaxed);
    }

    pub fn display_ratio(&self) -> u32 {
        self.ratio.load(Ordering::Relaxed)
    }

    pub fn blit_engine(&self) -> &Arc<dyn BlitEngine> {
        &self.blit
    }

    /// Present a frame. Never blocks beyond the tunnel reclaim bound.
    pub fn show(&self, handle: BufferHandle) -> Result<()> {
        self.present(handle, SourceType::Capture)
    }

    /// Present the "no signal" picture full screen.
    pub fn show_signal(&self, handle: BufferHandle) -> Result<()> {
        self.present(handle, SourceType::Signal)
    }

    fn present(&self, handle: BufferHandle, source: SourceType) -> Result<()> {
        match self.topology.load() {
            Topology::SidebandWindow => {
                self.display.show(handle, self.display_ratio(), source)?;
            }
            Topology::Tunnel => {
                self.tunnel
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .present(self.display.as_ref(), handle)?;
            }
            Topology::BufferProducer => {
                debug!(%handle, "show ignored in buffer-producer topology");
                return Ok(());
            }
        }
        self.shown.fetch_add(1, Ordering::Relaxed);
        counter!("hdmirx_frames_shown").increment(1);
        Ok(())
    }

    pub fn clear_area(&self) {
        if let Err(e) = self.display.clear_area() {
            warn!("clear display area failed: {}", e);
        }
    }

    pub fn preview(&self) -> &PreviewPool {
        &self.preview
    }

    /// Fill the next preview buffer from `src` and tell the client.
    pub fn deliver_preview(&self, src: &Image) -> bool {
        match self.preview.deliver(self.blit.as_ref(), src) {
            Some((buffer_id, handle)) => self.notify_capture_complete(buffer_id, handle, false),
            None => false,
        }
    }

    /// Tell the buffer-producer client a capture finished. Suppressed while
    /// stopped unless `force` is set.
    pub fn notify_capture_complete(&self, buffer_id: u64, handle: BufferHandle, force: bool) -> bool {
        if !force && !self.is_running() {
            debug!(buffer_id, "capture result suppressed while stopped");
            return false;
        }
        self.notifier.capture_complete(buffer_id, handle);
        true
    }

    /// Re-send the most recent preview result.
    pub fn notify_last(&self, force: bool) -> bool {
        match self.preview.last() {
            Some((buffer_id, handle)) => self.notify_capture_complete(buffer_id, handle, force),
            None => false,
        }
    }

    pub fn start_record(&self, session: RecordSession) {
        self.record.store(Some(Arc::new(session)));
    }

    /// Returns whether a recording was running.
    pub fn stop_record(&self) -> bool {
        self.record.swap(None).is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.record.load().is_some()
    }

    pub fn send_to_encoder(&self, src: &Image, timestamp: Instant) -> bool {
        match &*self.record.load() {
            Some(session) => session.submit(self.blit.as_ref(), src, timestamp),
            None => false,
        }
    }

    pub fn shown(&self) -> u64 {
        self.shown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Compositor {
        queued: StdMutex<Vec<BufferHandle>>,
        reclaimed: StdMutex<Vec<BufferHandle>>,
    }

    impl DisplaySink for Compositor {
        fn show(&self, _: BufferHandle, _: u32, _: SourceType) -> Result<()> {
            Ok(())
        }

        fn clear_area(&self) -> Result<()> {
            Ok(())
        }

        fn queue_tunnel(&self, handle: BufferHandle) -> Result<()> {
            self.queued.lock().unwrap().push(handle);
            Ok(())
        }

        fn dequeue_tunnel(&self, _: Duration) -> Result<Option<BufferHandle>> {
            let mut queued = self.queued.lock().unwrap();
            if queued.is_empty() {
                return Ok(None);
            }
            let h = queued.remove(0);
            self.reclaimed.lock().unwrap().push(h);
            Ok(Some(h))
        }
    }

    #[test]
    fn tunnel_keeps_two_buffers_queued() {
        let compositor = Compositor::default();
        let mut tunnel = TunnelPresenter::new();
        for i in 1..=5 {
            tunnel.present(&compositor, BufferHandle(i)).unwrap();
            assert!(tunnel.queued() <= TunnelPresenter::MAX_QUEUED);
        }
        assert_eq!(
            *compositor.reclaimed.lock().unwrap(),
            vec![BufferHandle(1), BufferHandle(2), BufferHandle(3)]
        );
        assert_eq!(
            *compositor.queued.lock().unwrap(),
            vec![BufferHandle(4), BufferHandle(5)]
        );
    }
}
