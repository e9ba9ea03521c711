//! Raw NV12 recorder writing frames to a file

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use flume::{Receiver, Sender, TrySendError};
use tracing::{error, info, warn};

use super::{EncodeSink, EncoderFactory, EncoderMeta, RecordFrame, RecordSlots};
use crate::buffer::BufferAllocator;
use crate::error::{Error, Result};
use crate::pipeline::task::Task;

/// Frames buffered between the capture path and the disk
const WRITE_QUEUE_DEPTH: usize = 8;

struct Running {
    tx: Sender<Bytes>,
    writer: Task<u64>,
}

/// Copies each record slot out, releases it, and appends the bytes to
/// `meta.path` on a writer thread.
pub struct FileEncoder {
    allocator: Arc<dyn BufferAllocator>,
    setup: Mutex<Option<(EncoderMeta, RecordSlots)>>,
    running: Mutex<Option<Running>>,
}

impl FileEncoder {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            setup: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    fn write_loop(rx: Receiver<Bytes>, mut out: BufWriter<File>) -> u64 {
        let mut frames = 0u64;
        // Keeps draining after a stop request until the sender is dropped.
        while let Ok(frame) = rx.recv() {
            if let Err(e) = out.write_all(&frame) {
                error!("record write failed: {}", e);
                break;
            }
            frames += 1;
        }
        if let Err(e) = out.flush() {
            warn!("record flush failed: {}", e);
        }
        frames
    }
}

impl EncodeSink for FileEncoder {
    fn init(&self, meta: &EncoderMeta, slots: RecordSlots) -> Result<()> {
        if meta.width == 0 || meta.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "record size {}x{}",
                meta.width, meta.height
            )));
        }
        *self.setup.lock().unwrap_or_else(|p| p.into_inner()) = Some((meta.clone(), slots));
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let path = match &*self.setup.lock().unwrap_or_else(|p| p.into_inner()) {
            Some((meta, _)) => meta.path.clone(),
            None => return Err(Error::Encoder("start before init".into())),
        };
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if running.is_some() {
            return Ok(());
        }

        let file = File::create(&path)
            .map_err(|e| Error::Encoder(format!("{}: {}", path.display(), e)))?;
        let (tx, rx) = flume::bounded(WRITE_QUEUE_DEPTH);
        let out = BufWriter::new(file);
        let writer = Task::spawn("hdmirx-record", move |_| Self::write_loop(rx, out))?;
        info!("Record writer started for {}", path.display());
        *running = Some(Running { tx, writer });
        Ok(())
    }

    fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(Running { tx, writer }) = running {
            drop(tx);
            let frames = writer.join().unwrap_or(0);
            info!("Record writer finished after {} frames", frames);
        }
    }

    fn send_frame(&self, frame: RecordFrame, _flags: u32) -> bool {
        let slots = match &*self.setup.lock().unwrap_or_else(|p| p.into_inner()) {
            Some((_, slots)) => slots.clone(),
            None => return false,
        };
        let tx = match &*self.running.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(running) => running.tx.clone(),
            None => return false,
        };

        let data = match self.allocator.map(frame.handle) {
            Ok(map) => Bytes::copy_from_slice(&map[..frame.size.min(map.len())]),
            Err(e) => {
                warn!("record slot {} not mappable: {}", frame.index, e);
                return false;
            }
        };
        // The copy is ours; the slot can be reused right away.
        slots.release(frame.index);

        match tx.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("record writer behind, dropping frame");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for FileEncoder {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct FileEncoderFactory {
    allocator: Arc<dyn BufferAllocator>,
}

impl FileEncoderFactory {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { allocator }
    }
}

impl EncoderFactory for FileEncoderFactory {
    fn create(&self) -> Result<Arc<dyn EncodeSink>> {
        Ok(Arc::new(FileEncoder::new(self.allocator.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSpec, BufferUsage, HeapAllocator};
    use crate::capture::frame::PixelFormat;
    use std::time::Instant;

    #[test]
    fn frames_land_in_file_and_slots_are_released() {
        let alloc = Arc::new(HeapAllocator::memfd_only());
        let buf = alloc
            .allocate(&BufferSpec::new(4, 2, PixelFormat::Nv12, BufferUsage::ENCODER))
            .unwrap();
        alloc.map(buf.handle).unwrap()[..12].fill(0x5a);

        let path = std::env::temp_dir().join(format!("hdmirx-rec-{}.nv12", std::process::id()));
        let encoder = FileEncoder::new(alloc.clone());
        let slots = RecordSlots::new(2);
        let meta = EncoderMeta {
            width: 4,
            height: 2,
            fps: 60,
            port: super::super::DEFAULT_ENCODER_PORT,
            path: path.clone(),
        };
        encoder.init(&meta, slots.clone()).unwrap();
        encoder.start().unwrap();

        for _ in 0..2 {
            assert!(slots.acquire(1));
            let sent = encoder.send_frame(
                RecordFrame {
                    index: 1,
                    handle: buf.handle,
                    fd: buf.fd,
                    size: 12,
                    timestamp: Instant::now(),
                },
                0,
            );
            assert!(sent);
            assert!(!slots.is_in_flight(1));
        }
        encoder.stop();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![0x5a; 24]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn send_without_start_is_refused() {
        let encoder = FileEncoder::new(Arc::new(HeapAllocator::memfd_only()));
        let frame = RecordFrame {
            index: 0,
            handle: crate::buffer::BufferHandle(1),
            fd: -1,
            size: 0,
            timestamp: Instant::now(),
        };
        assert!(!encoder.send_frame(frame, 0));
    }
}
