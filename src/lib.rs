pub mod buffer;
pub mod capture;
pub mod display;
pub mod encode;
pub mod error;
pub mod pipeline;
pub mod transform;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use capture::frame::PixelFormat;
use pipeline::session::{EnhanceMode, OutputRange, Topology};

pub use error::{Error, Result};
pub use pipeline::{Collaborators, Command, Pipeline, PipelineStats, StopReport};

/// Prefix of environment overrides, e.g. `HDMIRX__CAPTURE__DEVICE`
pub const ENV_PREFIX: &str = "HDMIRX";

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub enhance: EnhanceConfig,
    pub debug: DebugConfig,
    /// File this configuration was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture node; empty to auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Format to force on the device; `None` keeps what the driver reports
    pub format: Option<PixelFormat>,
    pub topology: Topology,
    pub buffer_count: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub ring_size: usize,
    pub record_ring_size: usize,
    /// Frames dropped after every start while the receiver settles
    pub skip_frames: u32,
    pub dequeue_timeout_ms: u64,
    pub idle_poll_us: u64,
    /// Row alignment of every allocated buffer, in pixels
    pub stride_align: u32,
    /// Capture requests swallowed after start in buffer-producer mode
    pub prime_absorb: u32,
    /// Credits granted once priming completes
    pub prime_credit: i64,
    pub capture_cpu: Option<usize>,
    pub record_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhanceConfig {
    pub mode: EnhanceMode,
    pub output_range: OutputRange,
    pub interlaced: bool,
    pub display_ratio: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Frames to dump after each start; zero disables dumping
    pub dump_frames: u32,
    pub dump_dir: PathBuf,
    pub show_fps: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1920,
            height: 1080,
            format: None,
            topology: Topology::SidebandWindow,
            buffer_count: 4,
            frame_rate: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_size: 3,
            record_ring_size: 3,
            skip_frames: 0,
            dequeue_timeout_ms: 1000,
            idle_poll_us: 500,
            stride_align: 64,
            prime_absorb: 1,
            prime_credit: 2,
            capture_cpu: None,
            record_path: PathBuf::from("/tmp/hdmirx_record.nv12"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            dump_frames: 0,
            dump_dir: PathBuf::from("/tmp"),
            show_fps: false,
        }
    }
}

impl Config {
    /// Defaults, then the optional TOML file, then `HDMIRX__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let mut loaded: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        loaded.source = path.map(Path::to_path_buf);
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("hdmirx-cfg-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[capture]\ndevice = \"/dev/video3\"\ntopology = \"tunnel\"\n\n[pipeline]\nskip_frames = 2\n\n[enhance]\nmode = \"normal+luma\"\ndisplay_ratio = 1"
        )
        .unwrap();
        drop(file);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.capture.device, "/dev/video3");
        assert_eq!(config.capture.topology, Topology::Tunnel);
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.pipeline.skip_frames, 2);
        assert_eq!(config.pipeline.ring_size, 3);
        assert_eq!(
            config.enhance.mode,
            EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC
        );
        assert_eq!(config.enhance.display_ratio, 1);
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn numeric_mode_override() {
        let config: Config = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default()).unwrap())
            .set_override("enhance.mode", 5)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(
            config.enhance.mode,
            EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC
        );

        let bad = config::Config::builder()
            .set_override("enhance.mode", 64)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize::<Config>();
        assert!(bad.is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/hdmirx.toml"))).is_err());
    }
}
