//! Deinterlace stage: three fields in, two progressive frames out

use std::sync::atomic::Ordering;
use std::sync::{Arc, TryLockError};

use metrics::counter;
use tracing::{debug, info, trace, warn};

use super::ringbuf::SlotRing;
use super::task::StopToken;
use super::{Counters, FieldSet, Session, Shared};
use crate::buffer::{BufferCategory, BufferSpec, BufferUsage, OwnedBuffer};
use crate::error::Result;
use crate::transform::{DeinterlaceContext, Image, StageParams};

/// Fields needed for one transform
const WINDOW: usize = 3;

/// Worker state of the deinterlace stage, handed back to the controller on join
pub(crate) struct DeinterlaceStage {
    shared: Arc<Shared>,
    session: Arc<Session>,
    ctx: Option<Box<dyn DeinterlaceContext>>,
    generation: Option<u64>,
    params: Option<StageParams>,
    outputs: Vec<OwnedBuffer>,
    /// Reserved output index with the field generation it was built from
    out_ring: SlotRing<(usize, u64)>,
}

impl DeinterlaceStage {
    pub fn new(shared: Arc<Shared>, session: Arc<Session>) -> Result<Self> {
        let out_ring = SlotRing::new(shared.settings.ring_size)?;
        Ok(Self {
            shared,
            session,
            ctx: None,
            generation: None,
            params: None,
            outputs: Vec::new(),
            out_ring,
        })
    }

    pub fn run(mut self, token: StopToken) -> Self {
        while !token.is_stopped() {
            if !self.tick() {
                token.idle(self.shared.idle_poll());
            }
        }
        debug!("deinterlace stage exiting");
        self
    }

    pub fn has_context(&self) -> bool {
        self.ctx.is_some()
    }

    fn tick(&mut self) -> bool {
        // The reserved second frame of the last transform goes out first.
        if let Some((_, (index, generation))) = self.out_ring.pop() {
            self.show(index, generation);
            return true;
        }

        let Some(fields) = self.current_fields() else {
            if self.ctx.is_some() {
                self.release();
            }
            return self.discard_all();
        };

        if self.generation != Some(fields.generation) {
            match self.rebuild(&fields) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!("deinterlace rebuild failed: {}", e);
                    self.ctx = None;
                    self.outputs.clear();
                    self.generation = Some(fields.generation);
                }
            }
        }

        let Some(window) = self.session.field_ring.peek_window(WINDOW) else {
            return self.discard_stale(fields.generation);
        };
        if window.iter().any(|(_, f)| f.generation != fields.generation) {
            return self.discard_stale(fields.generation);
        }
        if self.ctx.is_none() {
            // No context for this generation; keep the window sliding.
            self.session.field_ring.pop();
            return true;
        }

        // Both output slots must be free before transforming.
        let free = self.out_ring.capacity() - self.out_ring.len();
        let Some(first) = self.out_ring.producer_slot().filter(|_| free >= 2) else {
            trace!("deinterlace outputs busy");
            return false;
        };
        let second = (first + 1) % self.out_ring.capacity();

        let inputs: Vec<Image> = window
            .iter()
            .filter_map(|(_, f)| fields.image(f.slot))
            .collect();
        let (Some(out_a), Some(out_b)) = (self.output(first), self.output(second)) else {
            self.session.field_ring.pop();
            return true;
        };
        let [f0, f1, f2] = match inputs.as_slice() {
            [a, b, c] => [*a, *b, *c],
            _ => {
                self.session.field_ring.pop();
                return true;
            }
        };

        let result = match self.ctx.as_mut() {
            Some(ctx) => ctx.transform([&f0, &f1, &f2], [&out_a, &out_b]),
            None => return false,
        };
        // Slide the window: the oldest field is done.
        self.session.field_ring.pop();

        if let Err(e) = result {
            warn!("deinterlace failed: {}", e);
            self.drop_frames(1);
            return true;
        }
        Counters::bump(&self.shared.counters.deinterlaced);

        let generation = fields.generation;
        if self.out_ring.push((first, generation)).is_err()
            || self.out_ring.push((second, generation)).is_err()
        {
            warn!("deinterlace output ring out of step");
            self.out_ring.drain();
            return true;
        }
        if let Some((_, (index, generation))) = self.out_ring.pop() {
            self.show(index, generation);
        }
        true
    }

    /// Field set the range stage currently writes, if deinterlacing is on.
    fn current_fields(&self) -> Option<Arc<FieldSet>> {
        let config = self.shared.config.load_full();
        self.session
            .fields
            .load_full()
            .filter(|_| config.deinterlace_active())
    }

    fn drop_frames(&self, n: u64) {
        self.shared.counters.dropped.fetch_add(n, Ordering::Relaxed);
        counter!("hdmirx_frames_dropped", "stage" => "deinterlace").increment(n);
    }

    fn output(&self, index: usize) -> Option<Image> {
        let params = self.params?;
        self.outputs.get(index).map(|b| Image {
            handle: b.handle(),
            fd: b.fd(),
            geometry: params.dst,
            format: params.dst_format,
        })
    }

    /// Show a reserved output unless the range stage has moved on to a
    /// newer field generation since it was built.
    fn show(&self, index: usize, generation: u64) {
        let current = self.current_fields().map(|f| f.generation);
        if current != Some(generation) {
            let pending = self.out_ring.drain().len() as u64;
            debug!(
                stale = generation,
                ?current,
                "dropping deinterlace outputs of an old generation"
            );
            self.drop_frames(1 + pending);
            return;
        }
        let Some(out) = self.outputs.get(index) else {
            return;
        };
        if let Err(e) = self.shared.dispatcher.show(out.handle()) {
            warn!("show of {} failed: {}", out.handle(), e);
        }
    }

    fn rebuild(&mut self, fields: &FieldSet) -> Result<bool> {
        let _guard = match self.shared.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        self.ctx = None;
        self.out_ring.drain();
        self.outputs.clear();
        self.generation = Some(fields.generation);
        self.params = Some(fields.params);

        let params = fields.params;
        let spec = BufferSpec::new(
            params.dst.width,
            params.dst.height,
            params.dst_format,
            BufferUsage::TRANSFORM | BufferUsage::COMPOSER | BufferUsage::CPU_WRITE,
        )
        .stride_align(self.shared.settings.stride_align);
        self.outputs = self.shared.table.allocate_set(
            BufferCategory::DeinterlaceOut,
            self.out_ring.capacity(),
            &spec,
        )?;
        self.ctx = Some(self.shared.deinterlace.init(&params)?);
        info!(
            generation = fields.generation,
            "deinterlace stage built for {}x{}",
            params.dst.width,
            params.dst.height
        );
        Ok(true)
    }

    fn release(&mut self) {
        let _guard = match self.shared.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };
        self.ctx = None;
        self.out_ring.drain();
        self.outputs.clear();
        self.generation = None;
        self.params = None;
        info!("deinterlace stage released");
    }

    /// Release fields written for an older generation.
    fn discard_stale(&self, generation: u64) -> bool {
        match self.session.field_ring.peek() {
            Some((_, f)) if f.generation != generation => {
                debug!(stale = f.generation, current = generation, "discarding stale field");
                self.session.field_ring.pop();
                true
            }
            _ => false,
        }
    }

    fn discard_all(&self) -> bool {
        let n = self.session.field_ring.drain().len();
        if n > 0 {
            debug!(fields = n, "discarding fields while inactive");
        }
        n > 0
    }
}
