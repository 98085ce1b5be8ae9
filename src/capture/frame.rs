use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
///
/// A frame is exclusively owned by whoever holds it (driver thread, slot or
/// processing worker). `Bytes` is immutable, so handing a frame on never
/// allows the producer to mutate it underneath the consumer.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, meta: FrameMetadata) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    /// Front-facing sensors deliver a mirrored image
    pub mirrored: bool,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl FrameMetadata {
    pub fn new(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            sequence,
            width,
            height,
            format,
            rotation: Rotation::Deg0,
            mirrored: false,
            device_timestamp: None,
        }
    }
}

/// Pixel formats handed to the downstream encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar Y followed by interleaved V/U at quarter resolution
    Nv21,
    /// Packed 32-bit A, R, G, B
    Argb,
}

impl PixelFormat {
    /// Size in bytes of a tightly packed frame of this format
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Nv21 => w * h + 2 * w.div_ceil(2) * h.div_ceil(2),
            PixelFormat::Argb => w * h * 4,
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Nv21 => *b"NV21",
            // V4L2_PIX_FMT_ARGB32
            PixelFormat::Argb => *b"BA24",
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelFormat::Nv21 => write!(f, "NV21"),
            PixelFormat::Argb => write!(f, "ARGB"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Nearest quarter turn for an arbitrary sensor orientation
    pub fn from_degrees(degrees: i32) -> Self {
        match ((degrees % 360 + 360) % 360 + 45) / 90 {
            1 => Rotation::Deg90,
            2 => Rotation::Deg180,
            3 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }
}
