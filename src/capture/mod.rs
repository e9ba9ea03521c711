pub mod device;
pub mod frame;
pub mod queue;
pub mod v4l2;

pub use device::{CaptureDevice, CropRect, DeviceFormat, ExtInfo};
pub use frame::{CapturedFrame, ColorRange, ColorSpace, Geometry, PixelFormat};
pub use queue::{CaptureQueue, Dequeue, QueueParams};
pub use v4l2::V4l2Device;
