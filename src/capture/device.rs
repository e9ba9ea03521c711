//! Kernel capture device contract

use std::os::fd::RawFd;
use std::time::Duration;

use crate::capture::frame::{ColorRange, ColorSpace, PixelFormat};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub multiplanar: bool,
}

/// Descriptor returned by a buffer query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelBuffer {
    pub index: u32,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub interlaced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

/// Signal properties reported by the receiver driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtInfo {
    pub fps: u32,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
}

/// Operations the pipeline issues against the capture node.
///
/// Every method takes `&self`: the capture worker dequeues while the range
/// stage requeues, so implementations serialize internally where needed.
pub trait CaptureDevice: Send + Sync {
    fn query_caps(&self) -> Result<DeviceCaps>;

    /// Ask for `count` buffers; returns how many the driver granted.
    /// A count of zero releases the kernel queue.
    fn request_buffers(&self, count: u32) -> Result<u32>;

    fn query_buffer(&self, index: u32) -> Result<KernelBuffer>;

    /// Hand buffer `index`, backed by `fd`, to the kernel.
    fn queue(&self, index: u32, fd: RawFd, length: u32) -> Result<()>;

    /// Block until a buffer can be dequeued or `timeout` passes.
    fn wait_readable(&self, timeout: Duration) -> Result<bool>;

    fn dequeue(&self) -> Result<DequeuedBuffer>;

    fn stream_on(&self) -> Result<()>;

    fn stream_off(&self) -> Result<()>;

    fn enum_formats(&self) -> Result<Vec<PixelFormat>>;

    fn try_format(&self, format: &DeviceFormat) -> Result<DeviceFormat>;

    fn get_format(&self) -> Result<DeviceFormat>;

    fn set_format(&self, format: &DeviceFormat) -> Result<DeviceFormat>;

    fn get_crop(&self) -> Result<CropRect>;

    fn set_crop(&self, rect: CropRect) -> Result<()>;

    fn set_frame_rate(&self, fps: u32) -> Result<()>;

    fn set_rotation(&self, degrees: u32) -> Result<()>;

    fn ext_info(&self) -> Result<ExtInfo>;
}
