//! Per-stream configuration shared with the workers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capture::frame::{ColorRange, ColorSpace, Geometry, PixelFormat};
use crate::error::Error;

/// Where finished frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Frames are composed straight into a window layer
    #[default]
    SidebandWindow,
    /// Frames are queued to the compositor through a tunnel
    Tunnel,
    /// An external client supplies buffers and asks for frames
    BufferProducer,
}

impl Topology {
    /// Sideband buffers are scanned out by the composer and need a cache flush.
    pub fn needs_cache_flush(self) -> bool {
        matches!(self, Topology::SidebandWindow)
    }
}

/// Enhancement mode bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EnhanceMode(u8);

impl EnhanceMode {
    pub const OFF: EnhanceMode = EnhanceMode(0);
    pub const NORMAL: EnhanceMode = EnhanceMode(1);
    pub const LIMITED_RANGE: EnhanceMode = EnhanceMode(2);
    pub const LUMA_CALC: EnhanceMode = EnhanceMode(4);

    const ALL: u8 = 0b111;

    pub const fn from_bits(bits: u8) -> Option<EnhanceMode> {
        if bits & !Self::ALL == 0 {
            Some(EnhanceMode(bits))
        } else {
            None
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: EnhanceMode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn union(self, other: EnhanceMode) -> EnhanceMode {
        EnhanceMode(self.0 | other.0)
    }

    pub const fn is_active(self) -> bool {
        self.0 != 0
    }

    /// Whether the range stage shows its own output for this input format.
    /// Luma statistics alone leave the raw frame on screen.
    pub fn produces_output(self, format: PixelFormat) -> bool {
        self.contains(Self::NORMAL)
            || (self.contains(Self::LIMITED_RANGE) && format == PixelFormat::Bgr24)
    }
}

impl std::ops::BitOr for EnhanceMode {
    type Output = EnhanceMode;

    fn bitor(self, rhs: EnhanceMode) -> EnhanceMode {
        self.union(rhs)
    }
}

impl fmt::Display for EnhanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_active() {
            return f.write_str("off");
        }
        let names = [
            (Self::NORMAL, "normal"),
            (Self::LIMITED_RANGE, "limited"),
            (Self::LUMA_CALC, "luma"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for EnhanceMode {
    type Err = Error;

    /// Accepts `off`, a numeric bitmask, or names joined with `+`
    /// such as `normal+luma`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(bits) = s.parse::<u8>() {
            return EnhanceMode::from_bits(bits)
                .ok_or_else(|| Error::InvalidArgument(format!("enhance mode bits {bits}")));
        }
        let mut mode = EnhanceMode::OFF;
        for part in s.split('+').map(str::trim) {
            mode = mode
                | match part.to_ascii_lowercase().as_str() {
                    "off" => EnhanceMode::OFF,
                    "normal" => EnhanceMode::NORMAL,
                    "limited" | "lf_range" => EnhanceMode::LIMITED_RANGE,
                    "luma" => EnhanceMode::LUMA_CALC,
                    other => {
                        return Err(Error::InvalidArgument(format!("enhance mode {other:?}")))
                    }
                };
        }
        Ok(mode)
    }
}

impl Serialize for EnhanceMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Accepts either a bitmask number or the textual form, so both
/// `mode = 5` and `mode = "normal+luma"` load.
struct EnhanceModeVisitor;

impl serde::de::Visitor<'_> for EnhanceModeVisitor {
    type Value = EnhanceMode;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an enhancement bitmask or mode names joined with '+'")
    }

    fn visit_u64<E: serde::de::Error>(self, bits: u64) -> Result<Self::Value, E> {
        u8::try_from(bits)
            .ok()
            .and_then(EnhanceMode::from_bits)
            .ok_or_else(|| E::custom(format!("enhance mode bits {bits}")))
    }

    fn visit_i64<E: serde::de::Error>(self, bits: i64) -> Result<Self::Value, E> {
        let bits = u64::try_from(bits).map_err(|_| E::custom(format!("enhance mode bits {bits}")))?;
        self.visit_u64(bits)
    }

    fn visit_str<E: serde::de::Error>(self, s: &str) -> Result<Self::Value, E> {
        s.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for EnhanceMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(EnhanceModeVisitor)
    }
}

/// Preferred output quantization for limited-range mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputRange {
    #[default]
    Auto,
    Limit,
    Full,
}

impl FromStr for OutputRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(OutputRange::Auto),
            "limit" | "limited" => Ok(OutputRange::Limit),
            "full" => Ok(OutputRange::Full),
            other => Err(Error::InvalidArgument(format!("output range {other:?}"))),
        }
    }
}

/// Everything the workers need to know about the current stream.
///
/// Geometry, format and topology are fixed while streaming; the mode,
/// interlace flag and output range may change mid-stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub color_range: ColorRange,
    pub color_space: ColorSpace,
    pub topology: Topology,
    pub mode: EnhanceMode,
    pub interlaced: bool,
    pub output_range: OutputRange,
    pub display_ratio: u32,
    pub frame_rate: u32,
}

impl StreamConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry::new(self.width, self.height)
    }

    pub fn enhancement_enabled(&self) -> bool {
        self.mode.is_active() && self.topology != Topology::BufferProducer
    }

    pub fn deinterlace_active(&self) -> bool {
        self.enhancement_enabled() && self.mode.contains(EnhanceMode::NORMAL) && self.interlaced
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            format: PixelFormat::Bgr24,
            color_range: ColorRange::Default,
            color_space: ColorSpace::default(),
            topology: Topology::default(),
            mode: EnhanceMode::OFF,
            interlaced: false,
            output_range: OutputRange::Auto,
            display_ratio: 0,
            frame_rate: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("off".parse::<EnhanceMode>().unwrap(), EnhanceMode::OFF);
        assert_eq!(
            "normal+luma".parse::<EnhanceMode>().unwrap(),
            EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC
        );
        assert_eq!("2".parse::<EnhanceMode>().unwrap(), EnhanceMode::LIMITED_RANGE);
        assert!("9".parse::<EnhanceMode>().is_err());
        assert!("sharpen".parse::<EnhanceMode>().is_err());
        assert_eq!(
            (EnhanceMode::NORMAL | EnhanceMode::LUMA_CALC).to_string(),
            "normal+luma"
        );
    }

    #[test]
    fn output_depends_on_mode_and_format() {
        assert!(EnhanceMode::NORMAL.produces_output(PixelFormat::Nv12));
        assert!(EnhanceMode::LIMITED_RANGE.produces_output(PixelFormat::Bgr24));
        assert!(!EnhanceMode::LIMITED_RANGE.produces_output(PixelFormat::Nv16));
        assert!(!EnhanceMode::LUMA_CALC.produces_output(PixelFormat::Bgr24));
        assert!(!EnhanceMode::OFF.contains(EnhanceMode::OFF));
    }

    #[test]
    fn producer_topology_disables_enhancement() {
        let config = StreamConfig {
            mode: EnhanceMode::NORMAL,
            interlaced: true,
            ..Default::default()
        };
        assert!(config.deinterlace_active());
        let producer = StreamConfig {
            topology: Topology::BufferProducer,
            ..config
        };
        assert!(!producer.enhancement_enabled());
        assert!(!producer.deinterlace_active());
    }
}
