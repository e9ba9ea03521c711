//! Pipeline controller: lifecycle, configuration and the command surface

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument, warn};

use super::capture_worker::{wants_range_stage, CaptureWorker};
use super::command::Command;
use super::deinterlace::DeinterlaceStage;
use super::enhance::RangeStage;
use super::ringbuf::MIN_CAPACITY;
use super::session::{EnhanceMode, OutputRange, StreamConfig, Topology};
use super::task::Task;
use super::{Counters, Credits, PipelineStats, Session, Shared};
use crate::buffer::{BufferAllocator, BufferCategory, BufferSpec, BufferTable, BufferUsage, OwnedBuffer};
use crate::capture::device::{CaptureDevice, CropRect, DeviceFormat, ExtInfo};
use crate::capture::frame::{Geometry, PixelFormat};
use crate::capture::queue::{CaptureQueue, QueueParams};
use crate::display::{CaptureNotifier, DisplaySink, SinkDispatcher};
use crate::encode::{EncoderFactory, EncoderMeta, RecordSession, DEFAULT_ENCODER_PORT, FALLBACK_FPS};
use crate::error::{Error, Result};
use crate::transform::{BlitEngine, DeinterlaceEngine, RangeEngine};
use crate::{CaptureConfig, Config};

/// External services the pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub device: Arc<dyn CaptureDevice>,
    pub allocator: Arc<dyn BufferAllocator>,
    pub display: Arc<dyn DisplaySink>,
    pub notifier: Arc<dyn CaptureNotifier>,
    pub range: Arc<dyn RangeEngine>,
    pub deinterlace: Arc<dyn DeinterlaceEngine>,
    pub blit: Arc<dyn BlitEngine>,
    pub encoder: Arc<dyn EncoderFactory>,
}

/// What a [`Pipeline::stop`] released
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub workers_joined: usize,
    pub capture_buffers_released: usize,
    /// Every buffer released by the stop, capture buffers included
    pub buffers_released: usize,
}

#[derive(Default)]
struct Workers {
    capture: Option<Task<u64>>,
    range: Option<Task<RangeStage>>,
    deinterlace: Option<Task<DeinterlaceStage>>,
}

impl Workers {
    fn request_stop(&self) {
        if let Some(t) = &self.capture {
            t.request_stop();
        }
        if let Some(t) = &self.range {
            t.request_stop();
        }
        if let Some(t) = &self.deinterlace {
            t.request_stop();
        }
    }

    /// Join every worker and drop the stage state they hand back.
    fn join(self) -> usize {
        let mut joined = 0;
        if let Some(t) = self.capture {
            let frames = t.join();
            debug!(?frames, "capture worker joined");
            joined += 1;
        }
        if let Some(t) = self.range {
            if let Some(stage) = t.join() {
                debug!(context = stage.has_context(), "range stage joined");
            }
            joined += 1;
        }
        if let Some(t) = self.deinterlace {
            if let Some(stage) = t.join() {
                debug!(context = stage.has_context(), "deinterlace stage joined");
            }
            joined += 1;
        }
        joined
    }
}

struct Running {
    session: Arc<Session>,
    workers: Workers,
    ext: ExtInfo,
    /// "No signal" picture, allocated on first use
    signal: Option<OwnedBuffer>,
}

/// Owns the stream configuration and sequences the capture queue, the
/// workers and the sinks.
///
/// Every method takes `&self`; lifecycle calls are serialized by one coarse
/// lock that the frame path never takes.
pub struct Pipeline {
    shared: Arc<Shared>,
    device: Arc<dyn CaptureDevice>,
    encoder: Arc<dyn EncoderFactory>,
    capture: CaptureConfig,
    source: Option<PathBuf>,
    requested: Mutex<Option<DeviceFormat>>,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        if config.pipeline.ring_size < MIN_CAPACITY {
            return Err(Error::InvalidArgument(format!(
                "ring_size {} is below {}",
                config.pipeline.ring_size, MIN_CAPACITY
            )));
        }
        if config.pipeline.record_ring_size == 0 {
            return Err(Error::InvalidArgument("record_ring_size must be positive".into()));
        }

        let topology = config.capture.topology;
        let mode = if topology == Topology::BufferProducer {
            EnhanceMode::OFF
        } else {
            config.enhance.mode
        };
        let stream = StreamConfig {
            width: config.capture.width,
            height: config.capture.height,
            format: config.capture.format.unwrap_or(PixelFormat::Bgr24),
            topology,
            mode,
            interlaced: config.enhance.interlaced,
            output_range: config.enhance.output_range,
            display_ratio: config.enhance.display_ratio,
            frame_rate: config.capture.frame_rate,
            ..Default::default()
        };
        let requested = config.capture.format.map(|format| DeviceFormat {
            width: config.capture.width,
            height: config.capture.height,
            format,
            interlaced: false,
        });

        let dispatcher = SinkDispatcher::new(
            collaborators.display,
            collaborators.notifier,
            collaborators.blit,
        );
        dispatcher.configure(topology, stream.display_ratio);

        let shared = Arc::new(Shared {
            config: ArcSwap::from_pointee(stream),
            settings: config.pipeline,
            debug: config.debug,
            lifecycle: Mutex::new(()),
            streaming: Default::default(),
            dispatcher,
            table: BufferTable::new(collaborators.allocator),
            range: collaborators.range,
            deinterlace: collaborators.deinterlace,
            counters: Counters::default(),
            credits: Credits::default(),
        });

        Ok(Self {
            shared,
            device: collaborators.device,
            encoder: collaborators.encoder,
            capture: config.capture,
            source: config.source,
            requested: Mutex::new(requested),
            running: Mutex::new(None),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.shared
            .lifecycle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current stream configuration
    pub fn config(&self) -> StreamConfig {
        (**self.shared.config.load()).clone()
    }

    fn update_config(&self, f: impl FnOnce(&mut StreamConfig)) -> StreamConfig {
        let mut config = self.config();
        f(&mut config);
        self.shared.config.store(Arc::new(config.clone()));
        config
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.is_streaming()
    }

    pub fn buffer_table(&self) -> &BufferTable {
        &self.shared.table
    }

    /// Start streaming. A second call while streaming is a no-op.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let _guard = self.lifecycle();
        let mut running = self.running();
        if running.is_some() {
            debug!("start ignored, already streaming");
            return Ok(());
        }

        let (stream, ext) = self.negotiate()?;
        let settings = &self.shared.settings;
        let params = QueueParams {
            width: stream.width,
            height: stream.height,
            format: stream.format,
            buffer_count: self.capture.buffer_count,
            stride_align: settings.stride_align,
        };
        let queue = CaptureQueue::start(self.device.clone(), &self.shared.table, &params)?;
        let session = Arc::new(Session::new(queue, settings.ring_size, settings.skip_frames)?);

        self.shared.config.store(Arc::new(stream.clone()));
        self.shared.credits.reset();
        self.shared
            .dispatcher
            .configure(stream.topology, stream.display_ratio);
        self.shared.dispatcher.set_running(true);
        self.shared.streaming.store(true, Ordering::Release);

        let worker = CaptureWorker::new(self.shared.clone(), session.clone());
        let capture = match Task::spawn("hdmirx-capture", move |token| worker.run(token)) {
            Ok(task) => task,
            Err(e) => {
                self.shared.streaming.store(false, Ordering::Release);
                self.shared.dispatcher.set_running(false);
                session.queue.stop();
                return Err(e);
            }
        };

        let mut state = Running {
            session,
            workers: Workers {
                capture: Some(capture),
                ..Default::default()
            },
            ext,
            signal: None,
        };
        if let Err(e) = self.ensure_stage_workers(&mut state) {
            warn!("enhancement workers not started: {}", e);
        }
        *running = Some(state);

        info!(
            "Streaming {}x{} {:?} {:?} mode={} interlaced={}",
            stream.width, stream.height, stream.format, stream.topology, stream.mode, stream.interlaced
        );
        Ok(())
    }

    /// Resolve geometry, format and signal properties for a new session.
    fn negotiate(&self) -> Result<(StreamConfig, ExtInfo)> {
        let requested = *self.requested.lock().unwrap_or_else(|p| p.into_inner());
        let format = match requested {
            Some(wanted) => self.device.set_format(&wanted)?,
            None => self.device.get_format()?,
        };
        let ext = match self.device.ext_info() {
            Ok(ext) => ext,
            Err(e) => {
                warn!("extended signal info unavailable: {}", e);
                ExtInfo::default()
            }
        };

        let mut stream = self.config();
        stream.width = format.width;
        stream.height = format.height;
        stream.format = format.format;
        stream.interlaced |= format.interlaced;
        stream.color_range = ext.color_range;
        stream.color_space = ext.color_space;
        if ext.fps > 0 {
            stream.frame_rate = ext.fps;
        }
        if stream.topology == Topology::BufferProducer {
            stream.mode = EnhanceMode::OFF;
        }
        info!(
            fps = ext.fps,
            range = ?ext.color_range,
            space = ?ext.color_space,
            "negotiated {}x{} {:?}",
            format.width,
            format.height,
            format.format
        );
        Ok((stream, ext))
    }

    /// Spawn the enhancement workers the current mode needs.
    fn ensure_stage_workers(&self, state: &mut Running) -> Result<()> {
        let config = self.shared.config.load_full();
        if wants_range_stage(&config) && state.workers.range.is_none() {
            let stage = RangeStage::new(self.shared.clone(), state.session.clone());
            state.workers.range = Some(Task::spawn("hdmirx-range", move |token| stage.run(token))?);
        }
        if config.deinterlace_active() && state.workers.deinterlace.is_none() {
            let stage = DeinterlaceStage::new(self.shared.clone(), state.session.clone())?;
            state.workers.deinterlace =
                Some(Task::spawn("hdmirx-deinterlace", move |token| stage.run(token))?);
        }
        Ok(())
    }

    /// Stop streaming and release everything the session held.
    ///
    /// Always completes; safe to call when not streaming.
    #[instrument(skip(self))]
    pub fn stop(&self) -> StopReport {
        let _guard = self.lifecycle();
        let Some(state) = self.running().take() else {
            debug!("stop ignored, not streaming");
            return StopReport::default();
        };
        let released_before = self.shared.table.released();

        self.shared.streaming.store(false, Ordering::Release);
        self.shared.dispatcher.set_running(false);
        if self.shared.dispatcher.stop_record() {
            info!("recording stopped with the stream");
        }

        let Running {
            session,
            workers,
            signal,
            ..
        } = state;
        workers.request_stop();
        let workers_joined = workers.join();

        if self.shared.config.load().topology == Topology::SidebandWindow {
            self.shared.dispatcher.clear_area();
        }

        let pending = session.range_ring.drain().len();
        if pending > 0 {
            debug!(pending, "returning frames left in the range ring");
        }
        session.field_ring.drain();
        session.fields.store(None);
        let capture_buffers_released = session.queue.stop();
        drop(signal);
        drop(session);
        let previews = self.shared.dispatcher.preview().clear();
        if previews > 0 {
            debug!(previews, "preview buffers released");
        }

        let report = StopReport {
            workers_joined,
            capture_buffers_released,
            buffers_released: self.shared.table.released() - released_before,
        };
        info!(
            "Pipeline stopped: {} workers joined, {} buffers released",
            report.workers_joined, report.buffers_released
        );
        report
    }

    /// Record the capture format for the next start. Ignored while streaming.
    pub fn set_format(&self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        let _guard = self.lifecycle();
        if self.is_streaming() {
            warn!("set_format ignored while streaming");
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!("format size {width}x{height}")));
        }
        let wanted = DeviceFormat {
            width,
            height,
            format,
            interlaced: false,
        };
        let applied = self.device.set_format(&wanted)?;
        *self.requested.lock().unwrap_or_else(|p| p.into_inner()) = Some(applied);
        self.update_config(|c| {
            c.width = applied.width;
            c.height = applied.height;
            c.format = applied.format;
        });
        info!("format set to {}x{} {:?}", applied.width, applied.height, applied.format);
        Ok(())
    }

    pub fn set_enhancement_mode(&self, mode: EnhanceMode) -> Result<()> {
        let _guard = self.lifecycle();
        let config = self.update_config(|c| {
            c.mode = if c.topology == Topology::BufferProducer {
                EnhanceMode::OFF
            } else {
                mode
            };
        });
        if config.mode != mode {
            info!("enhancement forced off in buffer-producer topology");
        } else {
            info!(%mode, "enhancement mode set");
        }
        match self.running().as_mut() {
            Some(state) => self.ensure_stage_workers(state),
            None => Ok(()),
        }
    }

    pub fn set_interlaced(&self, interlaced: bool) -> Result<()> {
        let _guard = self.lifecycle();
        self.update_config(|c| c.interlaced = interlaced);
        match self.running().as_mut() {
            Some(state) => self.ensure_stage_workers(state),
            None => Ok(()),
        }
    }

    pub fn set_output_range(&self, range: OutputRange) {
        let _guard = self.lifecycle();
        self.update_config(|c| c.output_range = range);
    }

    pub fn set_display_ratio(&self, ratio: u32) {
        self.update_config(|c| c.display_ratio = ratio);
        self.shared.dispatcher.set_display_ratio(ratio);
    }

    /// Start or stop recording. `path` defaults to the configured record path.
    #[instrument(skip(self))]
    pub fn request_record(&self, enabled: bool, path: Option<PathBuf>) -> Result<()> {
        let _guard = self.lifecycle();
        if !enabled {
            if self.shared.dispatcher.stop_record() {
                info!("recording stopped");
            }
            return Ok(());
        }

        let running = self.running();
        let state = running.as_ref().ok_or(Error::NotStreaming)?;
        if self.shared.dispatcher.is_recording() {
            debug!("already recording");
            return Ok(());
        }
        let config = self.shared.config.load();
        let meta = EncoderMeta {
            width: config.width,
            height: config.height,
            fps: if state.ext.fps > 0 {
                state.ext.fps
            } else {
                FALLBACK_FPS
            },
            port: DEFAULT_ENCODER_PORT,
            path: path.unwrap_or_else(|| self.shared.settings.record_path.clone()),
        };
        let session = RecordSession::open(
            &self.shared.table,
            self.encoder.as_ref(),
            meta,
            self.shared.settings.record_ring_size,
        )?;
        self.shared.dispatcher.start_record(session);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.shared.dispatcher.is_recording()
    }

    /// A buffer-producer client asks for the next frame in `buffer_id`.
    pub fn request_capture(&self, buffer_id: u64) -> Result<()> {
        let settings = &self.shared.settings;
        if self
            .shared
            .credits
            .absorb(settings.prime_absorb, settings.prime_credit)
        {
            debug!(buffer_id, "capture request absorbed while priming");
            return Ok(());
        }
        if !self.is_streaming() {
            debug!(buffer_id, "capture request while stopped");
            return Ok(());
        }
        self.shared.dispatcher.preview().release(buffer_id);
        self.shared.credits.grant();
        Ok(())
    }

    /// Import a client buffer the producer path fills.
    pub fn register_preview_buffer(
        &self,
        buffer_id: u64,
        fd: RawFd,
        len: usize,
        geometry: Geometry,
        format: PixelFormat,
    ) -> Result<()> {
        let handle = self.shared.dispatcher.preview().register(
            &self.shared.table,
            buffer_id,
            fd,
            len,
            geometry,
            format,
        )?;
        debug!(buffer_id, %handle, "preview buffer registered");
        Ok(())
    }

    pub fn set_rotation(&self, degrees: u32) -> Result<()> {
        if !matches!(degrees, 0 | 90 | 180 | 270) {
            return Err(Error::InvalidArgument(format!("rotation {degrees}")));
        }
        self.device.set_rotation(degrees)
    }

    pub fn set_crop(&self, rect: CropRect) -> Result<()> {
        if rect.width == 0 || rect.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "crop size {}x{}",
                rect.width, rect.height
            )));
        }
        self.device.set_crop(rect)
    }

    pub fn crop(&self) -> Result<CropRect> {
        self.device.get_crop()
    }

    pub fn set_frame_rate(&self, fps: u32) -> Result<()> {
        if fps == 0 {
            return Err(Error::InvalidArgument("frame rate 0".into()));
        }
        self.device.set_frame_rate(fps)?;
        self.update_config(|c| c.frame_rate = fps);
        Ok(())
    }

    /// Signal loss or return: stop recording and flush the last frame.
    pub fn toggle_stream(&self) -> Result<()> {
        let _guard = self.lifecycle();
        if self.shared.dispatcher.stop_record() {
            info!("recording stopped on signal change");
        }
        let mut running = self.running();
        let Some(state) = running.as_mut() else {
            debug!("signal toggle while stopped");
            return Ok(());
        };

        match self.shared.config.load().topology {
            Topology::BufferProducer => {
                self.shared.dispatcher.notify_last(true);
            }
            Topology::SidebandWindow | Topology::Tunnel => {
                if state.signal.is_none() {
                    state.signal = Some(self.allocate_signal()?);
                }
                if let Some(signal) = &state.signal {
                    self.shared.dispatcher.show_signal(signal.handle())?;
                }
            }
        }
        Ok(())
    }

    fn allocate_signal(&self) -> Result<OwnedBuffer> {
        let config = self.shared.config.load();
        let spec = BufferSpec::new(
            config.width,
            config.height,
            PixelFormat::Nv12,
            BufferUsage::COMPOSER | BufferUsage::CPU_WRITE,
        )
        .stride_align(self.shared.settings.stride_align);
        let buffer = self.shared.table.allocate(BufferCategory::Signal, 0, &spec)?;
        // Black in limited-range NV12.
        if let Ok(mut map) = buffer.map() {
            let luma = (spec.stride() as usize)
                .checked_mul(config.height as usize)
                .map_or(map.len(), |n| n.min(map.len()));
            map[..luma].fill(16);
            map[luma..].fill(128);
        }
        Ok(buffer)
    }

    /// Reload the display ratio from the configuration source.
    pub fn refresh_config(&self) -> Result<u32> {
        let ratio = Config::load(self.source.as_deref())?.enhance.display_ratio;
        self.set_display_ratio(ratio);
        info!(ratio, "display ratio refreshed");
        Ok(ratio)
    }

    pub fn dispatch(&self, command: Command) -> Result<()> {
        debug!(%command, "dispatch");
        match command {
            Command::RequestCapture { buffer_id } => self.request_capture(buffer_id),
            Command::SetEnhancement { mode } => self.set_enhancement_mode(mode),
            Command::SetRecord { enabled, path } => self.request_record(enabled, path),
            Command::RefreshConfig => self.refresh_config().map(|_| ()),
            Command::ToggleStream => self.toggle_stream(),
            Command::Start => self.start(),
            Command::Stop => {
                self.stop();
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        let mut stats = PipelineStats {
            streaming: self.is_streaming(),
            frames_captured: counters.captured.load(Ordering::Relaxed),
            frames_skipped: counters.skipped.load(Ordering::Relaxed),
            frames_dropped: counters.dropped.load(Ordering::Relaxed),
            frames_transformed: counters.transformed.load(Ordering::Relaxed),
            frames_deinterlaced: counters.deinterlaced.load(Ordering::Relaxed),
            frames_shown: self.shared.dispatcher.shown(),
            dequeue_errors: counters.dequeue_errors.load(Ordering::Relaxed),
            capture_fps: counters.fps.load(),
            mean_luma: counters.mean_luma.load(),
            live_buffers: self.shared.table.live_total(),
            ..Default::default()
        };
        if let Some(state) = self.running().as_ref() {
            stats.queue = state.session.queue.counters();
            stats.range_ring = state.session.range_ring.stats();
            stats.field_ring = state.session.field_ring.stats();
        }
        stats
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
