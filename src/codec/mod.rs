//! Codec engine boundary
//!
//! Stages talk to codecs only through `VideoDecoder` and `VideoEncoder`;
//! concrete engines are registered by name in `Backends`.

pub mod cli;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use anyhow::Result;
use bytes::Bytes;

use crate::pipeline::caps::{Fraction, PixelLayout};
use crate::pipeline::types::Timestamp;

/// Codec engine used when the configuration names none
#[cfg(feature = "ffmpeg")]
pub const DEFAULT_BACKEND: &str = "ffmpeg";
#[cfg(not(feature = "ffmpeg"))]
pub const DEFAULT_BACKEND: &str = "ffmpeg-cli";

/// A decoded picture, tightly packed
#[derive(Debug, Clone)]
pub struct Picture {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub pts: Timestamp,
}

/// One encoded access unit (Annex B)
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub pts: Timestamp,
    pub is_keyframe: bool,
}

/// Parameters an encoder is opened with
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    pub framerate: Fraction,
    pub bitrate: u32,
}

pub trait VideoDecoder: Send {
    /// Decode one access unit; a decoder may buffer and return nothing
    fn decode(&mut self, access_unit: &[u8], pts: Timestamp) -> Result<Vec<Picture>>;

    /// Drain buffered pictures at end-of-stream
    fn flush(&mut self) -> Result<Vec<Picture>>;
}

pub trait VideoEncoder: Send {
    /// Encode one picture laid out as the settings say
    fn encode(&mut self, picture: &[u8], pts: Timestamp, force_keyframe: bool) -> Result<Vec<EncodedUnit>>;

    fn flush(&mut self) -> Result<Vec<EncodedUnit>>;
}
