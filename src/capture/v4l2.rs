//! V4L2 capture node driven with DMA-BUF buffers

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{
    CaptureDevice, CropRect, DequeuedBuffer, DeviceCaps, DeviceFormat, ExtInfo, KernelBuffer,
};
use crate::capture::frame::{ColorRange, ColorSpace, PixelFormat};
use crate::error::{Error, Result};

const BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
const BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;
const MEMORY_DMABUF: u32 = 4;
const FIELD_NONE: u32 = 1;
const CID_ROTATE: u32 = 0x0098_0922;
/// First driver-private ioctl number
const BASE_VIDIOC_PRIVATE: u8 = 192;

#[repr(C)]
#[derive(Clone, Copy)]
struct RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
union PlaneMemory {
    mem_offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawPlane {
    bytesused: u32,
    length: u32,
    m: PlaneMemory,
    data_offset: u32,
    reserved: [u32; 11],
}

#[repr(C)]
#[derive(Clone, Copy)]
union BufferMemory {
    offset: u32,
    userptr: libc::c_ulong,
    planes: *mut RawPlane,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawBuffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: [u32; 4],
    sequence: u32,
    memory: u32,
    m: BufferMemory,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

/// `struct v4l2_format`; the union starts 8 bytes in on 64-bit targets.
/// Single and multi-planar pixel formats share their first four fields
/// (width, height, fourcc, field).
#[repr(C)]
#[derive(Clone, Copy)]
struct RawFormat {
    type_: u32,
    pad: u32,
    fmt: [u32; 50],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawFmtDesc {
    index: u32,
    type_: u32,
    flags: u32,
    description: [u8; 32],
    pixelformat: u32,
    mbus_code: u32,
    reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawRect {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawCrop {
    type_: u32,
    c: RawRect,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RawControl {
    id: u32,
    value: i32,
}

nix::ioctl_readwrite!(vidioc_enum_fmt, b'V', 2, RawFmtDesc);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, RawFormat);
nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, RawFormat);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, RequestBuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, RawBuffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, RawBuffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, RawBuffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, RawControl);
nix::ioctl_readwrite!(vidioc_g_crop, b'V', 59, RawCrop);
nix::ioctl_write_ptr!(vidioc_s_crop, b'V', 60, RawCrop);
nix::ioctl_readwrite!(vidioc_try_fmt, b'V', 64, RawFormat);
nix::ioctl_read!(hdmirx_get_fps, b'V', BASE_VIDIOC_PRIVATE, libc::c_int);
nix::ioctl_read!(hdmirx_get_color_range, b'V', BASE_VIDIOC_PRIVATE + 10, libc::c_int);
nix::ioctl_read!(hdmirx_get_color_space, b'V', BASE_VIDIOC_PRIVATE + 11, libc::c_int);

/// ioctl argument structs for which all-zero bytes is a valid value.
///
/// # Safety
///
/// Implementors must be `repr(C)` plain data: integers, arrays of integers,
/// raw pointers and unions of those. No references, no niches.
unsafe trait Zeroed: Copy {
    fn zeroed() -> Self {
        // SAFETY: guaranteed by the trait contract.
        unsafe { std::mem::zeroed() }
    }
}

unsafe impl Zeroed for RawPlane {}
unsafe impl Zeroed for RawBuffer {}
unsafe impl Zeroed for RawFormat {}
unsafe impl Zeroed for RawFmtDesc {}
unsafe impl Zeroed for RawCrop {}

/// HDMI receiver capture node
pub struct V4l2Device {
    device: Device,
    fd: RawFd,
    path: String,
    buf_type: AtomicU32,
}

impl V4l2Device {
    pub fn open(path: &str) -> Result<Self> {
        info!("Opening V4L2 capture node {}", path);
        let device = Device::with_path(path).map_err(|e| Error::device("open", e))?;
        let fd = device.handle().fd();
        Ok(Self {
            device,
            fd,
            path: path.to_string(),
            buf_type: AtomicU32::new(BUF_TYPE_VIDEO_CAPTURE),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn buf_type(&self) -> u32 {
        self.buf_type.load(Ordering::Relaxed)
    }

    fn is_mplane(&self) -> bool {
        self.buf_type() == BUF_TYPE_VIDEO_CAPTURE_MPLANE
    }

    fn raw_format(&self) -> Result<RawFormat> {
        let mut fmt = RawFormat::zeroed();
        fmt.type_ = self.buf_type();
        unsafe { vidioc_g_fmt(self.fd, &mut fmt) }.map_err(|e| Error::errno("VIDIOC_G_FMT", e))?;
        Ok(fmt)
    }

    fn decode_format(fmt: &RawFormat) -> Result<DeviceFormat> {
        let fourcc = FourCC::new(&fmt.fmt[2].to_le_bytes());
        let format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            Error::InvalidArgument(format!("unsupported capture fourcc {}", fourcc))
        })?;
        Ok(DeviceFormat {
            width: fmt.fmt[0],
            height: fmt.fmt[1],
            format,
            interlaced: fmt.fmt[3] > FIELD_NONE,
        })
    }

    fn encode_format(&self, requested: &DeviceFormat) -> Result<RawFormat> {
        let mut fmt = self.raw_format()?;
        fmt.fmt[0] = requested.width;
        fmt.fmt[1] = requested.height;
        fmt.fmt[2] = u32::from_le_bytes(requested.format.fourcc().repr);
        Ok(fmt)
    }

    fn private_query(
        &self,
        name: &'static str,
        query: unsafe fn(libc::c_int, *mut libc::c_int) -> nix::Result<libc::c_int>,
    ) -> Option<i32> {
        let mut value: libc::c_int = 0;
        match unsafe { query(self.fd, &mut value) } {
            Ok(_) => Some(value),
            Err(e) => {
                debug!("{} not supported by {}: {}", name, self.path, e);
                None
            }
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn query_caps(&self) -> Result<DeviceCaps> {
        let caps = self
            .device
            .query_caps()
            .map_err(|e| Error::device("VIDIOC_QUERYCAP", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        let multiplanar = caps.capabilities.contains(CapFlags::VIDEO_CAPTURE_MPLANE);
        if !multiplanar && !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::InvalidState(format!(
                "{} does not support video capture",
                self.path
            )));
        }
        let buf_type = if multiplanar {
            BUF_TYPE_VIDEO_CAPTURE_MPLANE
        } else {
            BUF_TYPE_VIDEO_CAPTURE
        };
        self.buf_type.store(buf_type, Ordering::Relaxed);

        Ok(DeviceCaps {
            driver: caps.driver,
            card: caps.card,
            multiplanar,
        })
    }

    #[instrument(skip(self))]
    fn request_buffers(&self, count: u32) -> Result<u32> {
        let mut req = RequestBuffers {
            count,
            type_: self.buf_type(),
            memory: MEMORY_DMABUF,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        unsafe { vidioc_reqbufs(self.fd, &mut req) }
            .map_err(|e| Error::errno("VIDIOC_REQBUFS", e))?;
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> Result<KernelBuffer> {
        let mut plane = RawPlane::zeroed();
        let mut buf = RawBuffer::zeroed();
        buf.index = index;
        buf.type_ = self.buf_type();
        buf.memory = MEMORY_DMABUF;
        if self.is_mplane() {
            buf.m.planes = &mut plane;
            buf.length = 1;
        }
        unsafe { vidioc_querybuf(self.fd, &mut buf) }
            .map_err(|e| Error::errno("VIDIOC_QUERYBUF", e))?;
        let length = if self.is_mplane() {
            plane.length
        } else {
            buf.length
        };
        Ok(KernelBuffer {
            index: buf.index,
            length,
        })
    }

    fn queue(&self, index: u32, fd: RawFd, length: u32) -> Result<()> {
        let mut plane = RawPlane::zeroed();
        let mut buf = RawBuffer::zeroed();
        buf.index = index;
        buf.type_ = self.buf_type();
        buf.memory = MEMORY_DMABUF;
        if self.is_mplane() {
            plane.m.fd = fd;
            plane.length = length;
            buf.m.planes = &mut plane;
            buf.length = 1;
        } else {
            buf.m.fd = fd;
            buf.length = length;
        }
        unsafe { vidioc_qbuf(self.fd, &mut buf) }.map_err(|e| Error::errno("VIDIOC_QBUF", e))?;
        Ok(())
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(fds[0]
                .revents()
                .is_some_and(|ev| ev.contains(PollFlags::POLLIN))),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(Error::errno("poll", e)),
        }
    }

    fn dequeue(&self) -> Result<DequeuedBuffer> {
        let mut plane = RawPlane::zeroed();
        let mut buf = RawBuffer::zeroed();
        buf.type_ = self.buf_type();
        buf.memory = MEMORY_DMABUF;
        if self.is_mplane() {
            buf.m.planes = &mut plane;
            buf.length = 1;
        }
        unsafe { vidioc_dqbuf(self.fd, &mut buf) }
            .map_err(|e| Error::errno("VIDIOC_DQBUF", e))?;
        let bytes_used = if self.is_mplane() {
            plane.bytesused
        } else {
            buf.bytesused
        };
        Ok(DequeuedBuffer {
            index: buf.index,
            bytes_used,
            sequence: buf.sequence,
        })
    }

    #[instrument(skip(self))]
    fn stream_on(&self) -> Result<()> {
        let buf_type = self.buf_type() as libc::c_int;
        unsafe { vidioc_streamon(self.fd, &buf_type) }
            .map_err(|e| Error::errno("VIDIOC_STREAMON", e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn stream_off(&self) -> Result<()> {
        let buf_type = self.buf_type() as libc::c_int;
        unsafe { vidioc_streamoff(self.fd, &buf_type) }
            .map_err(|e| Error::errno("VIDIOC_STREAMOFF", e))?;
        Ok(())
    }

    fn enum_formats(&self) -> Result<Vec<PixelFormat>> {
        let mut formats = Vec::new();
        for index in 0.. {
            let mut desc = RawFmtDesc::zeroed();
            desc.index = index;
            desc.type_ = self.buf_type();
            if unsafe { vidioc_enum_fmt(self.fd, &mut desc) }.is_err() {
                break;
            }
            let fourcc = FourCC::new(&desc.pixelformat.to_le_bytes());
            match PixelFormat::from_fourcc(fourcc) {
                Some(format) => formats.push(format),
                None => debug!("skipping unsupported format {}", fourcc),
            }
        }
        Ok(formats)
    }

    fn try_format(&self, format: &DeviceFormat) -> Result<DeviceFormat> {
        let mut fmt = self.encode_format(format)?;
        unsafe { vidioc_try_fmt(self.fd, &mut fmt) }
            .map_err(|e| Error::errno("VIDIOC_TRY_FMT", e))?;
        Self::decode_format(&fmt)
    }

    fn get_format(&self) -> Result<DeviceFormat> {
        Self::decode_format(&self.raw_format()?)
    }

    #[instrument(skip(self))]
    fn set_format(&self, format: &DeviceFormat) -> Result<DeviceFormat> {
        let mut fmt = self.encode_format(format)?;
        unsafe { vidioc_s_fmt(self.fd, &mut fmt) }
            .map_err(|e| Error::errno("VIDIOC_S_FMT", e))?;
        Self::decode_format(&fmt)
    }

    fn get_crop(&self) -> Result<CropRect> {
        let mut crop = RawCrop::zeroed();
        crop.type_ = self.buf_type();
        unsafe { vidioc_g_crop(self.fd, &mut crop) }
            .map_err(|e| Error::errno("VIDIOC_G_CROP", e))?;
        Ok(CropRect {
            left: crop.c.left,
            top: crop.c.top,
            width: crop.c.width,
            height: crop.c.height,
        })
    }

    fn set_crop(&self, rect: CropRect) -> Result<()> {
        let crop = RawCrop {
            type_: self.buf_type(),
            c: RawRect {
                left: rect.left,
                top: rect.top,
                width: rect.width,
                height: rect.height,
            },
        };
        unsafe { vidioc_s_crop(self.fd, &crop) }
            .map_err(|e| Error::errno("VIDIOC_S_CROP", e))?;
        Ok(())
    }

    fn set_frame_rate(&self, fps: u32) -> Result<()> {
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| Error::device("VIDIOC_S_PARM", e))?;
        Ok(())
    }

    fn set_rotation(&self, degrees: u32) -> Result<()> {
        let mut ctrl = RawControl {
            id: CID_ROTATE,
            value: degrees as i32,
        };
        unsafe { vidioc_s_ctrl(self.fd, &mut ctrl) }
            .map_err(|e| Error::errno("VIDIOC_S_CTRL", e))?;
        Ok(())
    }

    fn ext_info(&self) -> Result<ExtInfo> {
        let fps = self
            .private_query("GET_FPS", hdmirx_get_fps)
            .unwrap_or(0)
            .max(0) as u32;
        let color_range = self
            .private_query("GET_COLOR_RANGE", hdmirx_get_color_range)
            .map(ColorRange::from_raw)
            .unwrap_or_default();
        let color_space = self
            .private_query("GET_COLOR_SPACE", hdmirx_get_color_space)
            .map(ColorSpace::from_raw)
            .unwrap_or_default();
        if fps == 0 {
            warn!("{} reported no frame rate", self.path);
        }
        Ok(ExtInfo {
            fps,
            color_range,
            color_space,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_structs_start_zeroed() {
        let fmt = RawFormat::zeroed();
        assert_eq!(fmt.type_, 0);
        assert!(fmt.fmt.iter().all(|w| *w == 0));

        let buf = RawBuffer::zeroed();
        assert_eq!((buf.index, buf.length, buf.request_fd), (0, 0, 0));
        // SAFETY: every union member is an integer or a raw pointer.
        assert!(unsafe { buf.m.planes }.is_null());

        let desc = RawFmtDesc::zeroed();
        assert!(desc.description.iter().all(|b| *b == 0));
        let crop = RawCrop::zeroed();
        assert_eq!((crop.c.width, crop.c.height), (0, 0));
    }
}
