use std::os::fd::RawFd;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use v4l::FourCC;

use crate::buffer::BufferHandle;

/// A dequeued capture buffer handed out by the capture queue.
///
/// The frame stays application-owned until it is requeued exactly once,
/// either by the capture worker or by whichever stage took it over.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame {
    pub slot: usize,
    pub handle: BufferHandle,
    pub fd: RawFd,
    pub sequence: u64,
    pub bytes_used: u32,
    pub timestamp: Instant,
}

/// Pixel formats the receiver and the transform units deal with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgr24,
    Nv12,
    Nv21,
    Yv12,
    /// 10-bit 4:2:0, four samples packed in five bytes
    Nv15,
    Nv16,
    Nv24,
    Yuyv,
    Rgb565,
    Rgb32,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 10] = [
        PixelFormat::Bgr24,
        PixelFormat::Nv12,
        PixelFormat::Nv21,
        PixelFormat::Yv12,
        PixelFormat::Nv15,
        PixelFormat::Nv16,
        PixelFormat::Nv24,
        PixelFormat::Yuyv,
        PixelFormat::Rgb565,
        PixelFormat::Rgb32,
    ];

    pub fn fourcc(self) -> FourCC {
        FourCC::new(match self {
            PixelFormat::Bgr24 => b"BGR3",
            PixelFormat::Nv12 => b"NV12",
            PixelFormat::Nv21 => b"NV21",
            PixelFormat::Yv12 => b"YV12",
            PixelFormat::Nv15 => b"NV15",
            PixelFormat::Nv16 => b"NV16",
            PixelFormat::Nv24 => b"NV24",
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Rgb565 => b"RGBP",
            PixelFormat::Rgb32 => b"RGB4",
        })
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.fourcc() == fourcc)
    }

    pub fn is_rgb(self) -> bool {
        matches!(
            self,
            PixelFormat::Bgr24 | PixelFormat::Rgb565 | PixelFormat::Rgb32
        )
    }

    /// Bytes needed for one frame with the given stride and height.
    pub fn frame_size(self, stride: u32, height: u32) -> usize {
        let px = stride as usize * height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yv12 => px * 3 / 2,
            PixelFormat::Nv15 => px * 15 / 8,
            PixelFormat::Nv16 | PixelFormat::Yuyv | PixelFormat::Rgb565 => px * 2,
            PixelFormat::Nv24 | PixelFormat::Bgr24 => px * 3,
            PixelFormat::Rgb32 => px * 4,
        }
    }

    /// Bytes per row of the first plane for a stride expressed in pixels.
    pub fn row_bytes(self, stride: u32) -> usize {
        let stride = stride as usize;
        match self {
            PixelFormat::Nv15 => stride * 10 / 8,
            PixelFormat::Yuyv | PixelFormat::Rgb565 => stride * 2,
            PixelFormat::Bgr24 => stride * 3,
            PixelFormat::Rgb32 => stride * 4,
            _ => stride,
        }
    }
}

impl From<PixelFormat> for FourCC {
    fn from(format: PixelFormat) -> Self {
        format.fourcc()
    }
}

/// Quantization range reported by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    #[default]
    Default,
    Limited,
    Full,
}

/// Two-valued view of [`ColorRange`]; an unspecified range counts as full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeClass {
    Full,
    Limited,
}

impl ColorRange {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ColorRange::Limited,
            2 => ColorRange::Full,
            _ => ColorRange::Default,
        }
    }

    pub fn class(self) -> RangeClass {
        match self {
            ColorRange::Limited => RangeClass::Limited,
            ColorRange::Default | ColorRange::Full => RangeClass::Full,
        }
    }
}

/// Colorimetry reported by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    Xvycc601,
    #[default]
    Xvycc709,
    Sycc601,
    AdobeYcc601,
    AdobeRgb,
    Bt2020ConstLuma,
    Bt2020,
    Bt2020RgbOrYcc,
}

impl ColorSpace {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => ColorSpace::Xvycc601,
            2 => ColorSpace::Sycc601,
            3 => ColorSpace::AdobeYcc601,
            4 => ColorSpace::AdobeRgb,
            5 => ColorSpace::Bt2020ConstLuma,
            6 => ColorSpace::Bt2020,
            7 => ColorSpace::Bt2020RgbOrYcc,
            _ => ColorSpace::Xvycc709,
        }
    }

    pub fn is_bt601(self) -> bool {
        matches!(self, ColorSpace::Xvycc601 | ColorSpace::Sycc601)
    }
}

/// Frame geometry, strides in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub h_stride: u32,
    pub v_stride: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            h_stride: width,
            v_stride: height,
        }
    }

    pub fn with_stride_align(width: u32, height: u32, align: u32) -> Self {
        Self {
            width,
            height,
            h_stride: crate::utils::align_up(width, align),
            v_stride: height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_is_bijective() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Nv12.frame_size(1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(PixelFormat::Bgr24.frame_size(1920, 1080), 1920 * 1080 * 3);
        assert_eq!(PixelFormat::Yuyv.frame_size(64, 2), 256);
        assert_eq!(PixelFormat::Rgb32.frame_size(4, 4), 64);
        assert_eq!(PixelFormat::Nv15.frame_size(64, 8), 64 * 8 * 15 / 8);
    }

    #[test]
    fn default_range_counts_as_full() {
        assert_eq!(ColorRange::Default.class(), RangeClass::Full);
        assert_eq!(ColorRange::Full.class(), RangeClass::Full);
        assert_eq!(ColorRange::Limited.class(), RangeClass::Limited);
        assert_eq!(ColorRange::from_raw(7), ColorRange::Default);
    }
}
