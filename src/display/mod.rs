pub mod sink;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, trace};

use crate::buffer::BufferHandle;
use crate::error::Result;

pub use sink::{PreviewPool, SinkDispatcher, TunnelPresenter};

/// What a shown buffer carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// A live frame
    Capture,
    /// The full-screen "no signal" picture
    Signal,
}

/// Compositor side of the pipeline
pub trait DisplaySink: Send + Sync {
    /// Put `handle` on the window layer.
    fn show(&self, handle: BufferHandle, ratio: u32, source: SourceType) -> Result<()>;

    fn clear_area(&self) -> Result<()>;

    /// Queue a buffer on the tunnel.
    fn queue_tunnel(&self, handle: BufferHandle) -> Result<()>;

    /// Reclaim the oldest tunnel buffer the compositor has released.
    fn dequeue_tunnel(&self, timeout: Duration) -> Result<Option<BufferHandle>>;
}

/// Receiver of capture results in the buffer-producer topology
pub trait CaptureNotifier: Send + Sync {
    fn capture_complete(&self, buffer_id: u64, handle: BufferHandle);
}

/// Display that only records what it was asked to present.
///
/// Used when no compositor is attached; the tunnel releases buffers as soon
/// as they are dequeued.
#[derive(Default)]
pub struct LogDisplay {
    tunnel: Mutex<VecDeque<BufferHandle>>,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplaySink for LogDisplay {
    fn show(&self, handle: BufferHandle, ratio: u32, source: SourceType) -> Result<()> {
        trace!(%handle, ratio, ?source, "show");
        counter!("hdmirx_display_frames").increment(1);
        Ok(())
    }

    fn clear_area(&self) -> Result<()> {
        debug!("clear display area");
        Ok(())
    }

    fn queue_tunnel(&self, handle: BufferHandle) -> Result<()> {
        self.tunnel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(handle);
        counter!("hdmirx_display_frames").increment(1);
        Ok(())
    }

    fn dequeue_tunnel(&self, _timeout: Duration) -> Result<Option<BufferHandle>> {
        Ok(self
            .tunnel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front())
    }
}

/// Notifier that logs each completed capture request
#[derive(Debug, Default)]
pub struct LogNotifier;

impl CaptureNotifier for LogNotifier {
    fn capture_complete(&self, buffer_id: u64, handle: BufferHandle) {
        debug!(buffer_id, %handle, "capture complete");
    }
}
