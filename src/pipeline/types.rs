//! Core data-plane types for the pipeline

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

use super::caps::Format;

/// Timestamp representation for media buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Microseconds since pipeline start
    pub micros: i64,
}

impl Timestamp {
    /// Create a new timestamp from microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    /// Create a timestamp from a duration since pipeline start
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            micros: duration.as_micros() as i64,
        }
    }

    /// Timestamp expressed in the 90 kHz RTP video clock
    pub fn to_rtp_clock(&self) -> u32 {
        ((self.micros.max(0) as u128 * 90_000 / 1_000_000) & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}µs", self.micros)
    }
}

/// Axis-aligned box in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// One object reported by the detection engine
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

/// RGBA colour with components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub red: f32,
    pub green: f32,
    pub blue: f32,
    pub alpha: f32,
}

impl Color {
    pub const WHITE: Color = Color::rgba(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::rgba(0.0, 0.0, 0.0, 1.0);

    pub const fn rgba(red: f32, green: f32, blue: f32, alpha: f32) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// Quantize to 8-bit RGBA
    pub fn to_rgba8(self) -> [u8; 4] {
        let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        [q(self.red), q(self.green), q(self.blue), q(self.alpha)]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FontParams {
    pub name: String,
    pub size: u32,
    pub color: Color,
}

/// A text label to be rendered by the overlay stage
#[derive(Debug, Clone, PartialEq)]
pub struct TextParams {
    pub text: String,
    pub x_offset: u32,
    pub y_offset: u32,
    pub font: FontParams,
    /// Opaque background drawn behind the text, if any
    pub background: Option<Color>,
}

/// A rectangle outline to be rendered by the overlay stage
#[derive(Debug, Clone, PartialEq)]
pub struct RectParams {
    pub bbox: BBox,
    pub border_width: u32,
    pub border_color: Color,
}

/// Drawing directives attached to a single frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayDescriptor {
    pub texts: Vec<TextParams>,
    pub rects: Vec<RectParams>,
}

/// A single frame (compressed access unit or raw picture)
///
/// Exactly one stage owns a frame at a time; it moves stage to stage over
/// the link channels.
#[derive(Clone)]
pub struct Frame {
    /// Upstream pad index at the muxer (0 for single-source pipelines)
    pub source_id: u32,
    /// Sequence number assigned by the stage that created the frame
    pub frame_num: u64,
    pub pts: Timestamp,
    pub format: Format,
    pub data: Bytes,
    pub is_keyframe: bool,
    /// Attached by the inference stage
    pub detections: Vec<Detection>,
    /// Attached by the annotation probe, consumed by the overlay stage
    pub overlay: Option<OverlayDescriptor>,
    /// Position in the inference batch this frame went through
    pub batch: Option<BatchInfo>,
}

/// Where a frame sat within its inference batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_id: u64,
    pub index: usize,
    pub len: usize,
}

impl Frame {
    pub fn new(format: Format, data: Bytes, pts: Timestamp, frame_num: u64) -> Self {
        Self {
            source_id: 0,
            frame_num,
            pts,
            format,
            data,
            is_keyframe: false,
            detections: Vec::new(),
            overlay: None,
            batch: None,
        }
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("source_id", &self.source_id)
            .field("frame_num", &self.frame_num)
            .field("pts", &self.pts)
            .field("format", &self.format.to_string())
            .field("size", &self.size())
            .field("is_keyframe", &self.is_keyframe)
            .field("detections", &self.detections.len())
            .field("overlay", &self.overlay.is_some())
            .finish()
    }
}

/// Frames grouped by the muxer for batched inference
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: u64,
    pub frames: Vec<Frame>,
    /// Arrival of the first frame of the batch
    pub opened_at: Instant,
    /// `opened_at` plus the batching timeout
    pub deadline: Instant,
    /// When the batch was sealed, never later than `deadline`
    pub sealed_at: Instant,
}

impl Batch {
    /// Age of the batch at the moment it was sealed
    pub fn age(&self) -> Duration {
        self.sealed_at.saturating_duration_since(self.opened_at)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One serialized RTP packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Timestamp,
    pub sequence_number: u16,
    /// Last packet of an access unit
    pub marker: bool,
}

/// The unit travelling over a link
#[derive(Debug, Clone)]
pub enum Buffer {
    Frame(Frame),
    Batch(Batch),
    Packet(Packet),
}

impl Buffer {
    pub fn size(&self) -> usize {
        match self {
            Buffer::Frame(frame) => frame.size(),
            Buffer::Batch(batch) => batch.frames.iter().map(Frame::size).sum(),
            Buffer::Packet(packet) => packet.data.len(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Buffer::Frame(_) => "frame",
            Buffer::Batch(_) => "batch",
            Buffer::Packet(_) => "packet",
        }
    }
}

/// Items exchanged over link channels
#[derive(Debug, Clone)]
pub enum Flow {
    Buffer(Buffer),
    /// No more data will follow on this link
    Eos,
}
