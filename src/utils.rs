use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};
use v4l::{capability::Flags, Device};

use crate::capture::frame::Geometry;
use crate::error::{Error, Result};

/// Frames between two FPS samples
pub const FPS_WINDOW: u32 = 32;

pub const fn align_up(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

pub const fn align_up_usize(value: usize, align: usize) -> usize {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Find the first node that can stream video capture
pub fn auto_detect_device() -> Result<String> {
    info!("Auto-detecting capture devices...");

    for i in 0..16 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        if let Ok(dev) = Device::with_path(&path) {
            if let Ok(caps) = dev.query_caps() {
                let capture = caps.capabilities.contains(Flags::VIDEO_CAPTURE)
                    || caps.capabilities.contains(Flags::VIDEO_CAPTURE_MPLANE);
                if capture && caps.capabilities.contains(Flags::STREAMING) {
                    info!("Found capture device: {} - {} ({})", path, caps.card, caps.driver);
                    return Ok(path);
                }
            }
        }
    }

    Err(Error::InvalidState("no suitable capture device found".into()))
}

/// Samples the frame rate once every [`FPS_WINDOW`] frames
#[derive(Debug)]
pub struct FpsMeter {
    frames: u32,
    window_start: Option<Instant>,
    last: f64,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            frames: 0,
            window_start: None,
            last: 0.0,
        }
    }

    /// Count one frame; returns a fresh sample when a window completes.
    pub fn tick(&mut self, now: Instant) -> Option<f64> {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        if self.frames < FPS_WINDOW {
            return None;
        }
        let elapsed = now.duration_since(start).as_secs_f64();
        self.frames = 0;
        self.window_start = Some(now);
        if elapsed <= 0.0 {
            return None;
        }
        self.last = f64::from(FPS_WINDOW) / elapsed;
        Some(self.last)
    }

    pub fn last(&self) -> f64 {
        self.last
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a bounded number of raw frames to disk for inspection
#[derive(Debug)]
pub struct FrameDumper {
    dir: PathBuf,
    remaining: u32,
    written: u32,
}

impl FrameDumper {
    pub fn new(dir: impl Into<PathBuf>, budget: u32) -> Self {
        Self {
            dir: dir.into(),
            remaining: budget,
            written: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.remaining > 0
    }

    pub fn dump(&mut self, geometry: Geometry, data: &[u8]) -> Option<PathBuf> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let path = self.dir.join(format!(
            "hdmirx_dump_{}x{}_{}.yuv",
            geometry.width, geometry.height, self.written
        ));
        self.written += 1;
        match fs::write(&path, data) {
            Ok(()) => {
                debug!("dumped {} bytes to {}", data.len(), path.display());
                Some(path)
            }
            Err(e) => {
                warn!("frame dump to {} failed: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn alignment() {
        assert_eq!(align_up(1920, 64), 1920);
        assert_eq!(align_up(1366, 64), 1408);
        assert_eq!(align_up(7, 1), 7);
        assert_eq!(align_up_usize(4097, 4096), 8192);
    }

    #[test]
    fn fps_is_sampled_every_window() {
        let mut meter = FpsMeter::new();
        let start = Instant::now();
        let mut samples = Vec::new();
        for i in 0..(FPS_WINDOW * 2) {
            let at = start + Duration::from_millis(u64::from(i + 1) * 20);
            if let Some(fps) = meter.tick(at) {
                samples.push(fps);
            }
        }
        assert_eq!(samples.len(), 2);
        assert!((samples[1] - 50.0).abs() < 0.5, "{samples:?}");
    }

    #[test]
    fn dumper_respects_budget() {
        let dir = std::env::temp_dir().join(format!("hdmirx-dump-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut dumper = FrameDumper::new(&dir, 2);
        let geo = Geometry::new(4, 2);
        assert!(dumper.dump(geo, &[1, 2, 3]).is_some());
        assert!(dumper.dump(geo, &[1, 2, 3]).is_some());
        assert!(dumper.dump(geo, &[1, 2, 3]).is_none());
        assert!(!dumper.is_armed());
        assert!(dir.join("hdmirx_dump_4x2_1.yuv").exists());
        fs::remove_dir_all(&dir).unwrap();
    }
}
