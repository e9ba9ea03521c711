//! CPU implementations of the transform units.
//!
//! Straightforward per-pixel code for hosts without the hardware blocks.
//! No matrix conversion is done between BT.601 and BT.709; only the
//! quantization range is remapped.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;

use super::{
    BlitEngine, Csc, DeinterlaceContext, DeinterlaceEngine, Image, RangeContext, RangeEngine,
    RangeReport, StageParams,
};
use crate::buffer::BufferAllocator;
use crate::capture::frame::PixelFormat;
use crate::error::{Error, Result};

#[derive(Clone, Copy)]
enum Sample {
    Yuv([u8; 3]),
    Rgb([u8; 3]),
}

fn check_len(buf: &[u8], img: &Image) -> Result<()> {
    let need = img
        .format
        .frame_size(img.geometry.h_stride, img.geometry.v_stride);
    if buf.len() < need {
        return Err(Error::Transform(format!(
            "{} holds {} bytes, {:?} {}x{} needs {}",
            img.handle,
            buf.len(),
            img.format,
            img.geometry.h_stride,
            img.geometry.v_stride,
            need
        )));
    }
    Ok(())
}

fn sample(buf: &[u8], img: &Image, x: usize, y: usize) -> Result<Sample> {
    let stride = img.geometry.h_stride as usize;
    let luma_size = stride * img.geometry.v_stride as usize;
    let s = match img.format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => {
            let c = luma_size + (y / 2) * stride + (x / 2) * 2;
            let (u, v) = if img.format == PixelFormat::Nv12 {
                (buf[c], buf[c + 1])
            } else {
                (buf[c + 1], buf[c])
            };
            Sample::Yuv([buf[y * stride + x], u, v])
        }
        PixelFormat::Yv12 => {
            let cstride = stride / 2;
            let plane = cstride * (img.geometry.v_stride as usize / 2);
            let c = (y / 2) * cstride + x / 2;
            let v = buf[luma_size + c];
            let u = buf[luma_size + plane + c];
            Sample::Yuv([buf[y * stride + x], u, v])
        }
        PixelFormat::Nv16 => {
            let c = luma_size + y * stride + (x / 2) * 2;
            Sample::Yuv([buf[y * stride + x], buf[c], buf[c + 1]])
        }
        PixelFormat::Nv24 => {
            let c = luma_size + y * stride * 2 + x * 2;
            Sample::Yuv([buf[y * stride + x], buf[c], buf[c + 1]])
        }
        PixelFormat::Yuyv => {
            let pair = y * stride * 2 + (x / 2) * 4;
            let luma = if x % 2 == 0 { buf[pair] } else { buf[pair + 2] };
            Sample::Yuv([luma, buf[pair + 1], buf[pair + 3]])
        }
        PixelFormat::Bgr24 => {
            let p = y * stride * 3 + x * 3;
            Sample::Rgb([buf[p + 2], buf[p + 1], buf[p]])
        }
        PixelFormat::Rgb32 => {
            let p = y * stride * 4 + x * 4;
            Sample::Rgb([buf[p], buf[p + 1], buf[p + 2]])
        }
        PixelFormat::Rgb565 => {
            let p = y * stride * 2 + x * 2;
            let v = u16::from_le_bytes([buf[p], buf[p + 1]]);
            let r = ((v >> 11) & 0x1f) as u8;
            let g = ((v >> 5) & 0x3f) as u8;
            let b = (v & 0x1f) as u8;
            Sample::Rgb([r << 3 | r >> 2, g << 2 | g >> 4, b << 3 | b >> 2])
        }
        PixelFormat::Nv15 => {
            return Err(Error::Transform("cannot read 10-bit sources".into()));
        }
    };
    Ok(s)
}

/// Full-swing YUV, chroma centered on 128
fn to_full_yuv(s: Sample, src: Csc) -> [f32; 3] {
    match s {
        Sample::Yuv([y, u, v]) => {
            if src.is_limited() {
                [
                    (f32::from(y) - 16.0) * 255.0 / 219.0,
                    (f32::from(u) - 128.0) * 255.0 / 224.0 + 128.0,
                    (f32::from(v) - 128.0) * 255.0 / 224.0 + 128.0,
                ]
            } else {
                [f32::from(y), f32::from(u), f32::from(v)]
            }
        }
        Sample::Rgb(rgb) => {
            let [r, g, b] = rgb.map(|c| {
                if src.is_limited() {
                    (f32::from(c) - 16.0) * 255.0 / 219.0
                } else {
                    f32::from(c)
                }
            });
            [
                0.299 * r + 0.587 * g + 0.114 * b,
                -0.1687 * r - 0.3313 * g + 0.5 * b + 128.0,
                0.5 * r - 0.4187 * g - 0.0813 * b + 128.0,
            ]
        }
    }
}

fn from_full_yuv([y, u, v]: [f32; 3], dst: Csc) -> [u8; 3] {
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    if dst.is_limited() {
        [
            clamp(16.0 + y * 219.0 / 255.0),
            clamp(128.0 + (u - 128.0) * 224.0 / 255.0),
            clamp(128.0 + (v - 128.0) * 224.0 / 255.0),
        ]
    } else {
        [clamp(y), clamp(u), clamp(v)]
    }
}

/// 8-bit 4:2:0 intermediate
struct Yuv420 {
    width: usize,
    height: usize,
    y: Vec<u8>,
    uv: Vec<u8>,
    luma_sum: f64,
}

impl Yuv420 {
    fn chroma_width(&self) -> usize {
        self.width.div_ceil(2)
    }

    fn mean_luma(&self) -> u8 {
        let n = (self.width * self.height).max(1) as f64;
        (self.luma_sum / n).round().clamp(0.0, 255.0) as u8
    }
}

fn convert(buf: &[u8], img: &Image, src: Csc, dst: Csc) -> Result<Yuv420> {
    check_len(buf, img)?;
    let width = img.geometry.width as usize;
    let height = img.geometry.height as usize;
    let cw = width.div_ceil(2);
    let ch = height.div_ceil(2);
    let mut out = Yuv420 {
        width,
        height,
        y: vec![0; width * height],
        uv: vec![128; cw * ch * 2],
        luma_sum: 0.0,
    };
    for row in 0..height {
        for col in 0..width {
            let full = to_full_yuv(sample(buf, img, col, row)?, src);
            out.luma_sum += f64::from(full[0].clamp(0.0, 255.0));
            let [y, u, v] = from_full_yuv(full, dst);
            out.y[row * width + col] = y;
            if row % 2 == 0 && col % 2 == 0 {
                let c = (row / 2) * cw * 2 + (col / 2) * 2;
                out.uv[c] = u;
                out.uv[c + 1] = v;
            }
        }
    }
    Ok(out)
}

/// Pack 10-bit samples four to five bytes, little-endian
fn pack_10bit(samples: impl Iterator<Item = u16>, out: &mut [u8]) {
    let mut acc: u64 = 0;
    let mut bits = 0;
    let mut pos = 0;
    for s in samples {
        acc |= u64::from(s & 0x3ff) << bits;
        bits += 10;
        while bits >= 8 && pos < out.len() {
            out[pos] = acc as u8;
            acc >>= 8;
            bits -= 8;
            pos += 1;
        }
    }
    if bits > 0 && pos < out.len() {
        out[pos] = acc as u8;
    }
}

fn write(planes: &Yuv420, buf: &mut [u8], img: &Image) -> Result<()> {
    check_len(buf, img)?;
    let stride = img.geometry.h_stride as usize;
    let width = planes.width.min(img.geometry.width as usize);
    let height = planes.height.min(img.geometry.height as usize);
    let cw = planes.chroma_width();

    match img.format {
        PixelFormat::Nv12 | PixelFormat::Nv21 => {
            let luma_size = stride * img.geometry.v_stride as usize;
            for row in 0..height {
                let src = &planes.y[row * planes.width..row * planes.width + width];
                buf[row * stride..row * stride + width].copy_from_slice(src);
            }
            let swap = img.format == PixelFormat::Nv21;
            for row in 0..height.div_ceil(2) {
                for c in 0..width.div_ceil(2) {
                    let s = row * cw * 2 + c * 2;
                    let d = luma_size + row * stride + c * 2;
                    let (u, v) = (planes.uv[s], planes.uv[s + 1]);
                    buf[d] = if swap { v } else { u };
                    buf[d + 1] = if swap { u } else { v };
                }
            }
            Ok(())
        }
        PixelFormat::Nv15 => {
            let row_bytes = img.format.row_bytes(img.geometry.h_stride);
            let luma_size = row_bytes * img.geometry.v_stride as usize;
            for row in 0..height {
                let src = &planes.y[row * planes.width..row * planes.width + width];
                let dst = &mut buf[row * row_bytes..(row + 1) * row_bytes];
                pack_10bit(src.iter().map(|&v| u16::from(v) << 2), dst);
            }
            for row in 0..height.div_ceil(2) {
                let src = &planes.uv[row * cw * 2..(row + 1) * cw * 2];
                let start = luma_size + row * row_bytes;
                let dst = &mut buf[start..start + row_bytes];
                pack_10bit(src.iter().map(|&v| u16::from(v) << 2), dst);
            }
            Ok(())
        }
        other => Err(Error::Transform(format!("cannot write {other:?}"))),
    }
}

/// Range/contrast correction on the CPU
pub struct SoftRange {
    allocator: Arc<dyn BufferAllocator>,
}

impl SoftRange {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { allocator }
    }
}

struct SoftRangeContext {
    allocator: Arc<dyn BufferAllocator>,
    params: StageParams,
}

impl RangeEngine for SoftRange {
    fn init(&self, params: &StageParams) -> Result<Box<dyn RangeContext>> {
        if params.src_format == PixelFormat::Nv15 {
            return Err(Error::Transform("10-bit input is not supported".into()));
        }
        if !matches!(params.dst_format, PixelFormat::Nv12 | PixelFormat::Nv15) {
            return Err(Error::Transform(format!(
                "unsupported output {:?}",
                params.dst_format
            )));
        }
        Ok(Box::new(SoftRangeContext {
            allocator: self.allocator.clone(),
            params: *params,
        }))
    }
}

impl RangeContext for SoftRangeContext {
    fn transform(&mut self, src: &Image, dst: Option<&Image>) -> Result<RangeReport> {
        let started = Instant::now();
        let src_map = self.allocator.map(src.handle)?;
        let planes = convert(&src_map, src, self.params.src_csc, self.params.dst_csc)?;
        if let Some(dst) = dst {
            let mut dst_map = self.allocator.map(dst.handle)?;
            write(&planes, &mut dst_map, dst)?;
        }
        histogram!("hdmirx_transform_us", "stage" => "range")
            .record(started.elapsed().as_micros() as f64);
        Ok(RangeReport {
            mean_luma: self.params.calc_mean_luma.then(|| planes.mean_luma()),
        })
    }
}

/// Motion-adaptive line interpolation on NV12 frames
pub struct SoftDeinterlace {
    allocator: Arc<dyn BufferAllocator>,
    threshold: u8,
}

impl SoftDeinterlace {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self {
            allocator,
            threshold: 8,
        }
    }
}

struct SoftDeinterlaceContext {
    allocator: Arc<dyn BufferAllocator>,
    threshold: u8,
}

impl DeinterlaceEngine for SoftDeinterlace {
    fn init(&self, params: &StageParams) -> Result<Box<dyn DeinterlaceContext>> {
        if params.dst_format != PixelFormat::Nv12 {
            return Err(Error::Transform(format!(
                "deinterlace expects NV12, got {:?}",
                params.dst_format
            )));
        }
        Ok(Box::new(SoftDeinterlaceContext {
            allocator: self.allocator.clone(),
            threshold: self.threshold,
        }))
    }
}

impl SoftDeinterlaceContext {
    /// Rebuild the lines of one parity from the other where the picture moves.
    fn fill_field(
        &self,
        out: &mut [u8],
        cur: &[u8],
        prev: &[u8],
        prev2: &[u8],
        img: &Image,
        odd: bool,
    ) {
        let stride = img.geometry.h_stride as usize;
        let width = img.geometry.width as usize;
        let height = img.geometry.height as usize;
        out.copy_from_slice(&cur[..out.len()]);

        let first = if odd { 1 } else { 0 };
        for row in (first..height).step_by(2) {
            let above = if row == 0 { 1 } else { row - 1 };
            let below = if row + 1 < height { row + 1 } else { above };
            for col in 0..width {
                let i = row * stride + col;
                let moving = cur[i].abs_diff(prev[i]) > self.threshold
                    || prev[i].abs_diff(prev2[i]) > self.threshold;
                if moving {
                    let a = u16::from(cur[above * stride + col]);
                    let b = u16::from(cur[below * stride + col]);
                    out[i] = ((a + b + 1) / 2) as u8;
                }
            }
        }
    }
}

impl DeinterlaceContext for SoftDeinterlaceContext {
    fn transform(&mut self, fields: [&Image; 3], outputs: [&Image; 2]) -> Result<()> {
        let started = Instant::now();
        let [prev2, prev, cur] = fields;
        let maps = [
            self.allocator.map(prev2.handle)?,
            self.allocator.map(prev.handle)?,
            self.allocator.map(cur.handle)?,
        ];
        for (map, img) in maps.iter().zip([prev2, prev, cur]) {
            check_len(map, img)?;
        }
        let frame_len = cur
            .format
            .frame_size(cur.geometry.h_stride, cur.geometry.v_stride);

        for (odd, out) in [(true, outputs[0]), (false, outputs[1])] {
            let mut dst = self.allocator.map(out.handle)?;
            check_len(&dst, out)?;
            self.fill_field(
                &mut dst[..frame_len],
                &maps[2],
                &maps[1],
                &maps[0],
                cur,
                odd,
            );
        }
        histogram!("hdmirx_transform_us", "stage" => "deinterlace")
            .record(started.elapsed().as_micros() as f64);
        Ok(())
    }
}

/// Copy or convert into NV12-family buffers
pub struct SoftBlit {
    allocator: Arc<dyn BufferAllocator>,
}

impl SoftBlit {
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { allocator }
    }
}

impl BlitEngine for SoftBlit {
    fn blit(&self, src: &Image, dst: &Image) -> Result<()> {
        let src_map = self.allocator.map(src.handle)?;
        let mut dst_map = self.allocator.map(dst.handle)?;
        check_len(&src_map, src)?;
        check_len(&dst_map, dst)?;

        if src.format == dst.format && src.geometry == dst.geometry {
            let len = src
                .format
                .frame_size(src.geometry.h_stride, src.geometry.v_stride);
            dst_map[..len].copy_from_slice(&src_map[..len]);
            return Ok(());
        }

        let src_csc = if src.format.is_rgb() {
            Csc::RgbFull
        } else {
            Csc::Yuv709Limited
        };
        let planes = convert(&src_map, src, src_csc, Csc::Yuv601Limited)?;
        write(&planes, &mut dst_map, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferSpec, BufferUsage, HeapAllocator};
    use crate::capture::frame::Geometry;

    fn image(alloc: &HeapAllocator, w: u32, h: u32, format: PixelFormat) -> Image {
        let a = alloc
            .allocate(&BufferSpec::new(w, h, format, BufferUsage::CPU_WRITE))
            .unwrap();
        Image {
            handle: a.handle,
            fd: a.fd,
            geometry: Geometry::new(w, h),
            format,
        }
    }

    #[test]
    fn packs_four_samples_in_five_bytes() {
        let mut out = [0u8; 5];
        pack_10bit([0x3ff, 0, 0x3ff, 0].into_iter(), &mut out);
        assert_eq!(out, [0xff, 0x03, 0xf0, 0x3f, 0x00]);
    }

    #[test]
    fn limited_to_full_expands_luma() {
        let remap = |s: Sample, src: Csc, dst: Csc| from_full_yuv(to_full_yuv(s, src), dst);
        assert_eq!(remap(Sample::Yuv([16, 128, 128]), Csc::Yuv709Limited, Csc::Yuv601Full)[0], 0);
        assert_eq!(remap(Sample::Yuv([235, 128, 128]), Csc::Yuv709Limited, Csc::Yuv601Full)[0], 255);
        assert_eq!(remap(Sample::Rgb([255, 255, 255]), Csc::RgbFull, Csc::Yuv601Limited)[0], 235);
    }

    #[test]
    fn bgr_white_frame_to_nv12() {
        let alloc = Arc::new(HeapAllocator::memfd_only());
        let src = image(&alloc, 4, 2, PixelFormat::Bgr24);
        let dst = image(&alloc, 4, 2, PixelFormat::Nv12);
        alloc.map(src.handle).unwrap()[..24].fill(255);

        let engine = SoftRange::new(alloc.clone());
        let params = StageParams {
            src: src.geometry,
            src_format: PixelFormat::Bgr24,
            src_csc: Csc::RgbFull,
            dst: dst.geometry,
            dst_format: PixelFormat::Nv12,
            dst_csc: Csc::Yuv601Full,
            mode: crate::pipeline::session::EnhanceMode::NORMAL,
            deinterlace: true,
            calc_mean_luma: true,
        };
        let mut ctx = engine.init(&params).unwrap();
        let report = ctx.transform(&src, Some(&dst)).unwrap();
        assert_eq!(report.mean_luma, Some(255));

        let out = alloc.map(dst.handle).unwrap();
        assert_eq!(&out[..8], &[255; 8]);
        assert_eq!(&out[8..12], &[128; 4]);
    }

    #[test]
    fn static_picture_is_left_untouched() {
        let alloc = Arc::new(HeapAllocator::memfd_only());
        let fields: Vec<Image> = (0..3).map(|_| image(&alloc, 4, 4, PixelFormat::Nv12)).collect();
        let outs: Vec<Image> = (0..2).map(|_| image(&alloc, 4, 4, PixelFormat::Nv12)).collect();
        for f in &fields {
            let mut m = alloc.map(f.handle).unwrap();
            for (i, px) in m[..16].iter_mut().enumerate() {
                *px = (i * 10) as u8;
            }
        }
        let params = StageParams {
            src: fields[0].geometry,
            src_format: PixelFormat::Nv12,
            src_csc: Csc::Yuv601Full,
            dst: fields[0].geometry,
            dst_format: PixelFormat::Nv12,
            dst_csc: Csc::Yuv601Full,
            mode: crate::pipeline::session::EnhanceMode::NORMAL,
            deinterlace: true,
            calc_mean_luma: false,
        };
        let mut ctx = SoftDeinterlace::new(alloc.clone()).init(&params).unwrap();
        ctx.transform([&fields[0], &fields[1], &fields[2]], [&outs[0], &outs[1]])
            .unwrap();
        let cur = alloc.map(fields[2].handle).unwrap();
        for out in &outs {
            let m = alloc.map(out.handle).unwrap();
            assert_eq!(&m[..24], &cur[..24]);
        }
    }

    #[test]
    fn moving_lines_are_interpolated() {
        let alloc = Arc::new(HeapAllocator::memfd_only());
        let fields: Vec<Image> = (0..3).map(|_| image(&alloc, 2, 4, PixelFormat::Nv12)).collect();
        let outs: Vec<Image> = (0..2).map(|_| image(&alloc, 2, 4, PixelFormat::Nv12)).collect();
        // Current frame has bright odd lines, history is black.
        {
            let mut m = alloc.map(fields[2].handle).unwrap();
            m[..8].copy_from_slice(&[0, 0, 200, 200, 0, 0, 200, 200]);
        }
        let params = StageParams {
            src: fields[0].geometry,
            src_format: PixelFormat::Nv12,
            src_csc: Csc::Yuv601Full,
            dst: fields[0].geometry,
            dst_format: PixelFormat::Nv12,
            dst_csc: Csc::Yuv601Full,
            mode: crate::pipeline::session::EnhanceMode::NORMAL,
            deinterlace: true,
            calc_mean_luma: false,
        };
        let mut ctx = SoftDeinterlace::new(alloc.clone()).init(&params).unwrap();
        ctx.transform([&fields[0], &fields[1], &fields[2]], [&outs[0], &outs[1]])
            .unwrap();
        let top = alloc.map(outs[0].handle).unwrap();
        // Row 1 rebuilt from rows 0 and 2, row 3 from row 2 only.
        assert_eq!(&top[..8], &[0, 0, 0, 0, 0, 0, 0, 0]);
        // Even rows match the history, so the second output keeps the frame.
        let bottom = alloc.map(outs[1].handle).unwrap();
        assert_eq!(&bottom[..8], &[0, 0, 200, 200, 0, 0, 200, 200]);
    }

    #[test]
    fn blit_same_format_copies() {
        let alloc = Arc::new(HeapAllocator::memfd_only());
        let src = image(&alloc, 8, 2, PixelFormat::Nv12);
        let dst = image(&alloc, 8, 2, PixelFormat::Nv12);
        alloc.map(src.handle).unwrap()[..24].fill(77);
        SoftBlit::new(alloc.clone()).blit(&src, &dst).unwrap();
        assert_eq!(&alloc.map(dst.handle).unwrap()[..24], &[77; 24]);
    }
}
