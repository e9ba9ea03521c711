//! Contracts for the hardware transform units
//!
//! The pipeline only depends on these traits. Contexts are bound to the
//! [`StageParams`] they were built with and are destroyed by dropping them.

pub mod soft;

use std::os::fd::RawFd;

use crate::buffer::BufferHandle;
use crate::capture::frame::{Geometry, PixelFormat};
use crate::error::Result;
use crate::pipeline::session::{EnhanceMode, OutputRange, StreamConfig};

pub use soft::{SoftBlit, SoftDeinterlace, SoftRange};

/// Color encoding of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Csc {
    RgbFull,
    RgbLimited,
    Yuv601Full,
    Yuv601Limited,
    Yuv709Full,
    Yuv709Limited,
}

impl Csc {
    pub fn is_rgb(self) -> bool {
        matches!(self, Csc::RgbFull | Csc::RgbLimited)
    }

    pub fn is_limited(self) -> bool {
        matches!(self, Csc::RgbLimited | Csc::Yuv601Limited | Csc::Yuv709Limited)
    }
}

/// A buffer as seen by a transform unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Image {
    pub handle: BufferHandle,
    pub fd: RawFd,
    pub geometry: Geometry,
    pub format: PixelFormat,
}

/// Everything a stage context depends on. Two equal keys share a context;
/// any difference forces a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageParams {
    pub src: Geometry,
    pub src_format: PixelFormat,
    pub src_csc: Csc,
    pub dst: Geometry,
    pub dst_format: PixelFormat,
    pub dst_csc: Csc,
    pub mode: EnhanceMode,
    pub deinterlace: bool,
    pub calc_mean_luma: bool,
}

impl StageParams {
    pub fn for_stream(stream: &StreamConfig, stride_align: u32) -> Self {
        let geometry = Geometry::with_stride_align(stream.width, stream.height, stride_align);

        // YUV sources are always treated as limited range.
        let src_csc = if stream.format.is_rgb() {
            match stream.color_range.class() {
                crate::capture::frame::RangeClass::Limited => Csc::RgbLimited,
                crate::capture::frame::RangeClass::Full => Csc::RgbFull,
            }
        } else if stream.color_space.is_bt601() {
            Csc::Yuv601Limited
        } else {
            Csc::Yuv709Limited
        };

        let dst_csc = if stream.mode.contains(EnhanceMode::LIMITED_RANGE)
            && stream.output_range == OutputRange::Limit
        {
            Csc::Yuv601Limited
        } else {
            Csc::Yuv601Full
        };

        let deinterlace = stream.deinterlace_active();
        Self {
            src: geometry,
            src_format: stream.format,
            src_csc,
            dst: geometry,
            dst_format: if deinterlace {
                PixelFormat::Nv12
            } else {
                PixelFormat::Nv15
            },
            dst_csc,
            mode: stream.mode,
            deinterlace,
            calc_mean_luma: stream.mode.contains(EnhanceMode::LUMA_CALC),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeReport {
    pub mean_luma: Option<u8>,
}

pub trait RangeEngine: Send + Sync {
    fn init(&self, params: &StageParams) -> Result<Box<dyn RangeContext>>;
}

pub trait RangeContext: Send {
    /// Convert `src` into `dst`. Without a destination only statistics
    /// are computed.
    fn transform(&mut self, src: &Image, dst: Option<&Image>) -> Result<RangeReport>;
}

pub trait DeinterlaceEngine: Send + Sync {
    fn init(&self, params: &StageParams) -> Result<Box<dyn DeinterlaceContext>>;
}

pub trait DeinterlaceContext: Send {
    /// `fields` is oldest first; the two outputs are in presentation order.
    fn transform(&mut self, fields: [&Image; 3], outputs: [&Image; 2]) -> Result<()>;
}

/// Format conversion and copy between buffers
pub trait BlitEngine: Send + Sync {
    fn blit(&self, src: &Image, dst: &Image) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{ColorRange, ColorSpace};

    fn stream() -> StreamConfig {
        StreamConfig {
            width: 1366,
            height: 768,
            mode: EnhanceMode::NORMAL,
            ..Default::default()
        }
    }

    #[test]
    fn rgb_source_follows_reported_range() {
        let mut s = stream();
        s.color_range = ColorRange::Limited;
        assert_eq!(StageParams::for_stream(&s, 64).src_csc, Csc::RgbLimited);
        s.color_range = ColorRange::Default;
        assert_eq!(StageParams::for_stream(&s, 64).src_csc, Csc::RgbFull);
    }

    #[test]
    fn yuv_source_is_forced_limited() {
        let mut s = stream();
        s.format = PixelFormat::Nv16;
        s.color_range = ColorRange::Full;
        s.color_space = ColorSpace::Sycc601;
        assert_eq!(StageParams::for_stream(&s, 64).src_csc, Csc::Yuv601Limited);
        s.color_space = ColorSpace::Bt2020;
        assert_eq!(StageParams::for_stream(&s, 64).src_csc, Csc::Yuv709Limited);
    }

    #[test]
    fn destination_and_output_format() {
        let mut s = stream();
        let p = StageParams::for_stream(&s, 64);
        assert_eq!(p.dst_csc, Csc::Yuv601Full);
        assert_eq!(p.dst_format, PixelFormat::Nv15);
        assert_eq!(p.src.h_stride, 1408);

        s.mode = EnhanceMode::LIMITED_RANGE;
        s.output_range = OutputRange::Limit;
        assert_eq!(StageParams::for_stream(&s, 64).dst_csc, Csc::Yuv601Limited);

        s.mode = EnhanceMode::NORMAL;
        s.interlaced = true;
        let p = StageParams::for_stream(&s, 64);
        assert!(p.deinterlace);
        assert_eq!(p.dst_format, PixelFormat::Nv12);
    }

    #[test]
    fn mean_luma_follows_statistics_bit() {
        let mut s = stream();
        assert!(!StageParams::for_stream(&s, 64).calc_mean_luma);
        s.mode = EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC;
        assert!(StageParams::for_stream(&s, 64).calc_mean_luma);
        s.mode = EnhanceMode::LUMA_CALC;
        assert!(StageParams::for_stream(&s, 64).calc_mean_luma);
    }

    #[test]
    fn range_class_change_changes_key() {
        let mut s = stream();
        s.color_range = ColorRange::Default;
        let a = StageParams::for_stream(&s, 64);
        s.color_range = ColorRange::Full;
        assert_eq!(a, StageParams::for_stream(&s, 64));
        s.color_range = ColorRange::Limited;
        assert_ne!(a, StageParams::for_stream(&s, 64));
    }
}
