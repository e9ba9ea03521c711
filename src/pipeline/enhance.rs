//! Range and contrast stage

use std::sync::atomic::Ordering;
use std::sync::{Arc, TryLockError};

use metrics::{counter, gauge};
use tracing::{debug, info, trace, warn};

use super::capture_worker::wants_range_stage;
use super::task::StopToken;
use super::{Counters, FieldRef, FieldSet, Session, Shared};
use crate::buffer::{BufferCategory, BufferSpec, BufferUsage, OwnedBuffer};
use crate::capture::CapturedFrame;
use crate::error::Result;
use crate::transform::{Image, RangeContext, StageParams};

enum Target {
    /// Statistics only, nothing to present
    Stats,
    Field { generation: u64, slot: usize },
    Show(usize),
}

/// Worker state of the range stage, handed back to the controller on join
pub(crate) struct RangeStage {
    shared: Arc<Shared>,
    session: Arc<Session>,
    ctx: Option<Box<dyn RangeContext>>,
    key: Option<StageParams>,
    outputs: Vec<OwnedBuffer>,
    cursor: usize,
}

impl RangeStage {
    pub fn new(shared: Arc<Shared>, session: Arc<Session>) -> Self {
        Self {
            shared,
            session,
            ctx: None,
            key: None,
            outputs: Vec::new(),
            cursor: 0,
        }
    }

    pub fn run(mut self, token: StopToken) -> Self {
        while !token.is_stopped() {
            if !self.tick() {
                token.idle(self.shared.idle_poll());
            }
        }
        debug!("range stage exiting");
        self
    }

    pub fn has_context(&self) -> bool {
        self.ctx.is_some()
    }

    /// One scheduling pass. Returns false when there was nothing to do.
    fn tick(&mut self) -> bool {
        let config = self.shared.config.load_full();
        if !wants_range_stage(&config) {
            if self.key.is_some() {
                self.release();
            }
            return self.pass_through();
        }

        let params = self.shared.stage_params(&config);
        if self.key != Some(params) {
            match self.rebuild(params) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!("range stage rebuild failed, passing frames through: {}", e);
                    self.ctx = None;
                    self.outputs.clear();
                    self.key = Some(params);
                }
            }
        }
        self.process()
    }

    /// Show pending inputs untouched.
    fn pass_through(&mut self) -> bool {
        let Some((_, frame)) = self.session.range_ring.pop() else {
            return false;
        };
        if let Err(e) = self.shared.dispatcher.show(frame.handle) {
            warn!("show of {} failed: {}", frame.handle, e);
        }
        self.requeue(&frame);
        true
    }

    /// Rebuild the context and buffers for `params`. Returns Ok(false) when
    /// the lifecycle lock is busy; the tick is retried later.
    fn rebuild(&mut self, params: StageParams) -> Result<bool> {
        let _guard = match self.shared.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        self.ctx = None;
        self.outputs.clear();
        self.key = Some(params);
        let generation = self.session.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.session.fields.store(None);

        let spec = BufferSpec::new(
            params.dst.width,
            params.dst.height,
            params.dst_format,
            BufferUsage::TRANSFORM
                | BufferUsage::COMPOSER
                | BufferUsage::CPU_READ
                | BufferUsage::CPU_WRITE,
        )
        .stride_align(self.shared.settings.stride_align);

        if params.deinterlace {
            let buffers = self.shared.table.allocate_set(
                BufferCategory::FieldIn,
                self.session.field_ring.capacity(),
                &spec,
            )?;
            self.session.fields.store(Some(Arc::new(FieldSet {
                generation,
                params,
                buffers,
            })));
        } else if params.mode.produces_output(params.src_format) {
            self.outputs = self.shared.table.allocate_set(
                BufferCategory::RangeOut,
                self.shared.settings.ring_size,
                &spec,
            )?;
        }
        self.cursor = 0;
        self.ctx = Some(self.shared.range.init(&params)?);

        info!(
            generation,
            mode = %params.mode,
            deinterlace = params.deinterlace,
            "range stage built for {}x{} {:?} -> {:?}",
            params.src.width,
            params.src.height,
            params.src_format,
            params.dst_format
        );
        Ok(true)
    }

    /// Drop the context once enhancement is switched off.
    fn release(&mut self) {
        let _guard = match self.shared.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        self.ctx = None;
        self.outputs.clear();
        self.key = None;
        if self.session.fields.swap(None).is_some() {
            self.session.generation.fetch_add(1, Ordering::AcqRel);
        }
        info!("range stage released");
    }

    fn process(&mut self) -> bool {
        let Some((_, frame)) = self.session.range_ring.peek() else {
            return false;
        };
        let Some(params) = self.key else {
            return false;
        };
        if self.ctx.is_none() {
            return self.pass_through();
        }

        let src = Image {
            handle: frame.handle,
            fd: frame.fd,
            geometry: params.src,
            format: params.src_format,
        };

        let (dst, target) = if !params.mode.produces_output(params.src_format) {
            (None, Target::Stats)
        } else if params.deinterlace {
            let Some(fields) = self.session.fields.load_full() else {
                return false;
            };
            // Never overwrite a field the deinterlacer has not consumed.
            let Some(slot) = self.session.field_ring.producer_slot() else {
                trace!("field ring full, input kept pending");
                return false;
            };
            (
                fields.image(slot),
                Target::Field {
                    generation: fields.generation,
                    slot,
                },
            )
        } else {
            let Some(out) = self.outputs.get(self.cursor) else {
                return self.pass_through();
            };
            let image = Image {
                handle: out.handle(),
                fd: out.fd(),
                geometry: params.dst,
                format: params.dst_format,
            };
            (Some(image), Target::Show(self.cursor))
        };

        let Some(ctx) = self.ctx.as_mut() else {
            return false;
        };
        let result = ctx.transform(&src, dst.as_ref());

        self.session.range_ring.pop();
        self.requeue(&frame);

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                warn!("range transform failed: {}", e);
                Counters::bump(&self.shared.counters.dropped);
                counter!("hdmirx_frames_dropped", "stage" => "range").increment(1);
                return true;
            }
        };
        Counters::bump(&self.shared.counters.transformed);
        if let Some(luma) = report.mean_luma {
            self.shared.counters.mean_luma.store(Some(luma));
            gauge!("hdmirx_mean_luma").set(f64::from(luma));
        }

        match target {
            Target::Stats => {}
            Target::Field { generation, slot } => {
                if self.session.field_ring.push(FieldRef { generation, slot }).is_err() {
                    warn!(slot, "field slot taken while transforming");
                }
            }
            Target::Show(index) => {
                if let Some(out) = self.outputs.get(index) {
                    if let Err(e) = self.shared.dispatcher.show(out.handle()) {
                        warn!("show of {} failed: {}", out.handle(), e);
                    }
                }
                self.cursor = (index + 1) % self.outputs.len().max(1);
            }
        }
        true
    }

    fn requeue(&self, frame: &CapturedFrame) {
        if let Err(e) = self.session.queue.requeue(frame.slot) {
            warn!("requeue of slot {} failed: {}", frame.slot, e);
        }
    }
}
