//! Dequeues filled buffers from the kernel and routes them

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, info, trace, warn};

use super::ringbuf::RingFull;
use super::session::{EnhanceMode, StreamConfig, Topology};
use super::task::StopToken;
use super::{Counters, Session, Shared};
use crate::capture::{CapturedFrame, Dequeue};
use crate::error::Error;
use crate::transform::Image;
use crate::utils::{FpsMeter, FrameDumper};

pub(crate) struct CaptureWorker {
    shared: Arc<Shared>,
    session: Arc<Session>,
    fps: FpsMeter,
    dumper: FrameDumper,
    timeout: Duration,
}

impl CaptureWorker {
    pub fn new(shared: Arc<Shared>, session: Arc<Session>) -> Self {
        let dumper = FrameDumper::new(shared.debug.dump_dir.clone(), shared.debug.dump_frames);
        let timeout = Duration::from_millis(shared.settings.dequeue_timeout_ms);
        Self {
            shared,
            session,
            fps: FpsMeter::new(),
            dumper,
            timeout,
        }
    }

    /// Worker body. Returns the number of frames dequeued.
    pub fn run(mut self, token: StopToken) -> u64 {
        if let Some(cpu) = self.shared.settings.capture_cpu {
            pin_to_core(cpu);
        }
        let mut frames = 0u64;
        while !token.is_stopped() {
            if self.tick(&token) {
                frames += 1;
            }
        }
        debug!(frames, "capture worker exiting");
        frames
    }

    /// One iteration. Returns true when a frame was dequeued.
    fn tick(&mut self, token: &StopToken) -> bool {
        let config = self.shared.config.load_full();
        let producer = config.topology == Topology::BufferProducer;
        if producer && !self.shared.credits.available() {
            token.idle(self.shared.idle_poll());
            return false;
        }

        let frame = match self.session.queue.dequeue(self.timeout) {
            Ok(Dequeue::Ready(frame)) => frame,
            Ok(Dequeue::Timeout) => {
                trace!("no frame within {:?}", self.timeout);
                return false;
            }
            Err(Error::NotStreaming) => {
                token.idle(self.shared.idle_poll());
                return false;
            }
            Err(e) => {
                Counters::bump(&self.shared.counters.dequeue_errors);
                warn!("dequeue failed: {}", e);
                return false;
            }
        };
        if token.is_stopped() {
            self.requeue(&frame);
            return true;
        }

        Counters::bump(&self.shared.counters.captured);
        counter!("hdmirx_frames_captured").increment(1);
        if let Some(fps) = self.fps.tick(frame.timestamp) {
            self.shared.counters.fps.store(fps);
            gauge!("hdmirx_capture_fps").set(fps);
            if self.shared.debug.show_fps {
                info!("capture {:.2} fps", fps);
            }
        }

        if self.session.skip_frame() {
            Counters::bump(&self.shared.counters.skipped);
            debug!(sequence = frame.sequence, "skipping frame after start");
            self.requeue(&frame);
            return true;
        }

        self.dump(&frame);

        if config.topology.needs_cache_flush() {
            if let Err(e) = self.shared.table.allocator().flush_cache(frame.handle) {
                warn!("cache flush of {} failed, dropping frame: {}", frame.handle, e);
                self.drop_frame(&frame, "flush");
                return true;
            }
        }

        let image = self.image(&frame);
        self.shared.dispatcher.send_to_encoder(&image, frame.timestamp);

        if producer {
            if self.shared.dispatcher.deliver_preview(&image) {
                self.shared.credits.take();
            }
            self.requeue(&frame);
            return true;
        }

        if wants_range_stage(&config) {
            // Statistics-only modes leave the raw frame on screen.
            if !config.mode.produces_output(config.format) {
                self.show(&frame);
            }
            if let Err(RingFull(frame)) = self.session.range_ring.push(frame) {
                self.drop_frame(&frame, "range");
            }
            return true;
        }

        self.show(&frame);
        self.requeue(&frame);
        true
    }

    fn image(&self, frame: &CapturedFrame) -> Image {
        Image {
            handle: frame.handle,
            fd: frame.fd,
            geometry: self.session.queue.geometry(),
            format: self.session.queue.format(),
        }
    }

    fn show(&self, frame: &CapturedFrame) {
        if let Err(e) = self.shared.dispatcher.show(frame.handle) {
            warn!("show of {} failed: {}", frame.handle, e);
        }
    }

    fn requeue(&self, frame: &CapturedFrame) {
        if let Err(e) = self.session.queue.requeue(frame.slot) {
            warn!("requeue of slot {} failed: {}", frame.slot, e);
        }
    }

    fn drop_frame(&self, frame: &CapturedFrame, stage: &'static str) {
        Counters::bump(&self.shared.counters.dropped);
        counter!("hdmirx_frames_dropped", "stage" => stage).increment(1);
        debug!(sequence = frame.sequence, stage, "frame dropped");
        self.requeue(frame);
    }

    fn dump(&mut self, frame: &CapturedFrame) {
        if !self.dumper.is_armed() {
            return;
        }
        match self.shared.table.allocator().map(frame.handle) {
            Ok(map) => {
                let len = (frame.bytes_used as usize).min(map.len());
                let len = if len == 0 { map.len() } else { len };
                self.dumper.dump(self.session.queue.geometry(), &map[..len]);
            }
            Err(e) => debug!("frame dump skipped: {}", e),
        }
    }
}

/// Whether frames of this stream go through the range stage
pub(crate) fn wants_range_stage(config: &StreamConfig) -> bool {
    config.enhancement_enabled()
        && (config.mode.produces_output(config.format) || config.mode.contains(EnhanceMode::LUMA_CALC))
}

fn pin_to_core(cpu: usize) {
    let core = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == cpu));
    match core {
        Some(core) if core_affinity::set_for_current(core) => {
            info!("capture worker pinned to cpu {}", cpu)
        }
        _ => warn!("could not pin capture worker to cpu {}", cpu),
    }
}
