//! Capture and enhancement workers and the controller that sequences them
//!
//! Data moves capture worker → range stage → deinterlace stage → sinks, each
//! hop a [`SlotRing`]. Workers read the stream configuration through an
//! `ArcSwap` snapshot and never take the lifecycle lock on the frame path.

pub mod capture_worker;
pub mod command;
pub mod controller;
pub mod deinterlace;
pub mod enhance;
pub mod ringbuf;
pub mod session;
pub mod task;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::atomic::AtomicCell;
use crossbeam::utils::CachePadded;

use crate::buffer::{BufferTable, OwnedBuffer};
use crate::capture::queue::QueueCounters;
use crate::capture::{CaptureQueue, CapturedFrame};
use crate::display::SinkDispatcher;
use crate::transform::{DeinterlaceEngine, Image, RangeEngine, StageParams};
use crate::{DebugConfig, PipelineConfig};

pub use command::Command;
pub use controller::{Collaborators, Pipeline, StopReport};
pub use ringbuf::{RingFull, RingStats, SlotRing};
pub use session::{EnhanceMode, OutputRange, StreamConfig, Topology};
pub use task::{StopToken, Task};

/// Frame counters shared by every worker
#[derive(Default)]
pub(crate) struct Counters {
    pub captured: CachePadded<AtomicU64>,
    pub skipped: CachePadded<AtomicU64>,
    pub dropped: CachePadded<AtomicU64>,
    pub transformed: CachePadded<AtomicU64>,
    pub deinterlaced: CachePadded<AtomicU64>,
    pub dequeue_errors: CachePadded<AtomicU64>,
    pub fps: AtomicCell<f64>,
    pub mean_luma: AtomicCell<Option<u8>>,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub streaming: bool,
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub frames_transformed: u64,
    pub frames_deinterlaced: u64,
    pub frames_shown: u64,
    pub dequeue_errors: u64,
    pub capture_fps: f64,
    pub mean_luma: Option<u8>,
    pub queue: QueueCounters,
    pub range_ring: RingStats,
    pub field_ring: RingStats,
    pub live_buffers: usize,
}

/// Capture-request credits of the buffer-producer topology.
///
/// The first `absorb` requests after a start are swallowed and seed the
/// credit pool; every later request adds one credit.
#[derive(Default)]
pub(crate) struct Credits {
    absorbed: AtomicU32,
    credits: AtomicI64,
}

impl Credits {
    pub fn reset(&self) {
        self.absorbed.store(0, Ordering::Release);
        self.credits.store(0, Ordering::Release);
    }

    /// Swallow a request while priming. Returns true when absorbed; the
    /// last absorbed request seeds `seed` credits.
    pub fn absorb(&self, absorb: u32, seed: i64) -> bool {
        let absorbed = self
            .absorbed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < absorb).then_some(n + 1)
            });
        match absorbed {
            Ok(n) => {
                if n + 1 == absorb {
                    self.credits.fetch_add(seed, Ordering::AcqRel);
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn grant(&self) {
        self.credits.fetch_add(1, Ordering::AcqRel);
    }

    pub fn available(&self) -> bool {
        self.credits.load(Ordering::Acquire) > 0
    }

    pub fn take(&self) -> bool {
        self.credits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then_some(c - 1))
            .is_ok()
    }

    pub fn current(&self) -> i64 {
        self.credits.load(Ordering::Acquire)
    }
}

/// A field written by the range stage for the deinterlacer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldRef {
    pub generation: u64,
    pub slot: usize,
}

/// Deinterlace input buffers of one range-stage generation, indexed by
/// field-ring slot
pub(crate) struct FieldSet {
    pub generation: u64,
    pub params: StageParams,
    pub buffers: Vec<OwnedBuffer>,
}

impl FieldSet {
    pub fn image(&self, slot: usize) -> Option<Image> {
        self.buffers.get(slot).map(|b| Image {
            handle: b.handle(),
            fd: b.fd(),
            geometry: self.params.dst,
            format: self.params.dst_format,
        })
    }
}

/// State that lives for one streaming session
pub(crate) struct Session {
    pub queue: CaptureQueue,
    pub range_ring: SlotRing<CapturedFrame>,
    pub field_ring: SlotRing<FieldRef>,
    pub fields: ArcSwapOption<FieldSet>,
    pub generation: AtomicU64,
    skip_remaining: AtomicU32,
}

impl Session {
    pub fn new(queue: CaptureQueue, ring_size: usize, skip_frames: u32) -> crate::Result<Self> {
        Ok(Self {
            queue,
            range_ring: SlotRing::new(ring_size)?,
            field_ring: SlotRing::new(ring_size)?,
            fields: ArcSwapOption::const_empty(),
            generation: AtomicU64::new(0),
            skip_remaining: AtomicU32::new(skip_frames),
        })
    }

    /// Consume one skip-frame credit if any remain.
    pub fn skip_frame(&self) -> bool {
        self.skip_remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Everything the controller shares with its workers
pub(crate) struct Shared {
    pub config: ArcSwap<StreamConfig>,
    pub settings: PipelineConfig,
    pub debug: DebugConfig,
    /// Serializes start, stop and stage rebuilds
    pub lifecycle: Mutex<()>,
    pub streaming: AtomicBool,
    pub dispatcher: SinkDispatcher,
    pub table: BufferTable,
    pub range: Arc<dyn RangeEngine>,
    pub deinterlace: Arc<dyn DeinterlaceEngine>,
    pub counters: Counters,
    pub credits: Credits,
}

impl Shared {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_micros(self.settings.idle_poll_us.max(1))
    }

    pub fn stage_params(&self, config: &StreamConfig) -> StageParams {
        StageParams::for_stream(config, self.settings.stride_align)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priming_absorbs_first_request() {
        let credits = Credits::default();
        assert!(credits.absorb(1, 2));
        assert_eq!(credits.current(), 2);
        assert!(!credits.absorb(1, 2));
        credits.grant();
        assert_eq!(credits.current(), 3);

        assert!(credits.take());
        assert!(credits.take());
        assert!(credits.take());
        assert!(!credits.take());
        assert!(!credits.available());

        credits.reset();
        assert!(credits.absorb(1, 2));
    }

    #[test]
    fn no_priming_never_absorbs() {
        let credits = Credits::default();
        assert!(!credits.absorb(0, 5));
        assert_eq!(credits.current(), 0);
    }
}
