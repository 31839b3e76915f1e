use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Captured frame, shareable across threads without copying.
///
/// Cloning only bumps the buffer's reference count; consumers that need the
/// pixels past the current tick keep a clone, never a borrowed slice.
#[derive(Clone)]
pub struct Frame {
    /// Immutable pixel data, `width * height * bytes_per_pixel` bytes
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host instant at which the dispatcher received the frame
    pub timestamp: Instant,
}

impl Frame {
    pub fn camera(&self) -> usize {
        self.meta.camera
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("meta", &self.meta)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Index of the originating camera
    pub camera: usize,
    /// Per-camera sequence number, strictly increasing from 0
    pub sequence: u64,
    /// Frame number reported by the device
    pub image_number: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Frame dimensions and layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Geometry {
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Mono8,
    /// 12-bit samples in 16-bit little-endian words
    Mono12,
    Mono16,
    #[serde(rename = "BayerRG8")]
    BayerRg8,
    #[serde(rename = "RGB8")]
    Rgb8,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 5] = [
        PixelFormat::Mono8,
        PixelFormat::Mono12,
        PixelFormat::Mono16,
        PixelFormat::BayerRg8,
        PixelFormat::Rgb8,
    ];

    /// Capability string as reported to the UI.
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::BayerRg8 => "BayerRG8",
            PixelFormat::Rgb8 => "RGB8",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            _ => 1,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelFormat::Mono12 | PixelFormat::Mono16 => 2,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.channels() * self.bytes_per_sample()
    }

    /// `-pix_fmt` tag for raw video input to the encoder.
    pub fn encoder_tag(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "gray",
            PixelFormat::Mono12 => "gray12le",
            PixelFormat::Mono16 => "gray16le",
            PixelFormat::BayerRg8 => "bayer_rggb8",
            PixelFormat::Rgb8 => "rgb24",
        }
    }

    /// NumPy dtype descriptor of one sample.
    pub fn npy_descr(&self) -> &'static str {
        match self.bytes_per_sample() {
            2 => "<u2",
            _ => "|u1",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::invalid("pixel format", format!("unsupported format {s:?}")))
    }
}
