//! FFmpeg-backed H.264 codecs

use std::collections::VecDeque;

use ac_ffmpeg::codec::video::{self, PixelFormat, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{Decoder, Encoder};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase, Timestamp as FfTimestamp};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use log::{debug, info, warn};

use super::{EncodedUnit, EncoderSettings, Picture, VideoDecoder, VideoEncoder};
use crate::pipeline::caps::PixelLayout;
use crate::pipeline::types::Timestamp;

fn rtp_time_base() -> TimeBase {
    TimeBase::new(1, 90_000)
}

fn to_ffmpeg(pts: Timestamp) -> FfTimestamp {
    FfTimestamp::new(pts.to_rtp_clock() as i64, rtp_time_base())
}

fn from_ffmpeg(pts: FfTimestamp) -> Timestamp {
    if pts.is_null() {
        return Timestamp::default();
    }
    Timestamp::from_micros(pts.timestamp() * 1_000_000 / 90_000)
}

/// H.264 decoder producing packed I420 pictures
pub struct FfmpegDecoder {
    decoder: video::VideoDecoder,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new() -> Result<Self> {
        let decoder = video::VideoDecoder::builder("h264")
            .context("h264 decoder not available")?
            .time_base(rtp_time_base())
            .build()
            .context("failed to open h264 decoder")?;
        Ok(Self { decoder })
    }

    fn drain(&mut self, out: &mut Vec<Picture>) -> Result<()> {
        while let Some(frame) = self.decoder.take()? {
            out.push(pack_i420(&frame)?);
        }
        Ok(())
    }
}

impl VideoDecoder for FfmpegDecoder {
    fn decode(&mut self, access_unit: &[u8], pts: Timestamp) -> Result<Vec<Picture>> {
        let packet = PacketMut::from(access_unit).with_pts(to_ffmpeg(pts)).freeze();
        self.decoder.push(packet).context("decoder rejected access unit")?;
        let mut out = Vec::new();
        self.drain(&mut out)?;
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<Picture>> {
        self.decoder.flush()?;
        let mut out = Vec::new();
        self.drain(&mut out)?;
        Ok(out)
    }
}

fn pack_i420(frame: &VideoFrame) -> Result<Picture> {
    let planes = frame.planes();
    if planes.len() < 3 {
        bail!("decoder produced a {}-plane picture, expected planar 4:2:0", planes.len());
    }
    let (w, h) = (frame.width(), frame.height());
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

    let mut packed = vec![0u8; w * h + cw * ch * 2];
    let (y, chroma) = packed.split_at_mut(w * h);
    let (u, v) = chroma.split_at_mut(cw * ch);
    extract_plane(y, planes[0].data(), planes[0].line_size(), w, h);
    extract_plane(u, planes[1].data(), planes[1].line_size(), cw, ch);
    extract_plane(v, planes[2].data(), planes[2].line_size(), cw, ch);

    Ok(Picture {
        layout: PixelLayout::I420,
        width: w as u32,
        height: h as u32,
        data: Bytes::from(packed),
        pts: from_ffmpeg(frame.pts()),
    })
}

/// Copy a padded plane into a contiguous one
#[inline]
fn extract_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }
    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}

/// Encoder fallback chain: hardware first, then software
///
/// The target bitrate comes from the stage settings, not from this table.
const ENCODER_CHAIN: &[(&str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        &[
            ("preset", "p2"),
            ("tune", "ll"),
            ("zerolatency", "1"),
            ("rc", "vbr"),
            ("gpu", "0"),
            ("delay", "0"),
            ("forced-idr", "1"),
        ],
    ),
    (
        "h264_qsv",
        &[("preset", "fast"), ("low_power", "0"), ("async_depth", "4")],
    ),
    (
        "h264_amf",
        &[
            ("usage", "lowlatency"),
            ("quality", "balanced"),
            ("rc", "vbr_peak"),
            ("frame_skipping", "0"),
        ],
    ),
    (
        "libx264",
        &[
            ("profile", "main"),
            ("preset", "fast"),
            ("tune", "zerolatency"),
            ("threads", "0"),
            ("sliced-threads", "1"),
            ("sync-lookahead", "0"),
            ("bframes", "0"),
        ],
    ),
];

/// Frames pre-allocated by the pool
const INITIAL_POOL_SIZE: usize = 4;

/// Reuses encoder input frames once the encoder released them
struct FramePool {
    frames: VecDeque<VideoFrame>,
    w: usize,
    h: usize,
    pixel_format: PixelFormat,
}

impl FramePool {
    fn new(w: usize, h: usize, pixel_format: PixelFormat) -> Self {
        let frames = (0..INITIAL_POOL_SIZE)
            .map(|_| {
                VideoFrameMut::black(pixel_format, w, h)
                    .with_time_base(rtp_time_base())
                    .freeze()
            })
            .collect();
        Self {
            frames,
            w,
            h,
            pixel_format,
        }
    }

    fn put(&mut self, frame: VideoFrame) {
        if self.frames.len() < INITIAL_POOL_SIZE * 2 {
            self.frames.push_back(frame);
        }
    }

    fn take(&mut self) -> VideoFrameMut {
        for _ in 0..self.frames.len() {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                Err(frame) => self.frames.push_back(frame),
            }
        }
        VideoFrameMut::black(self.pixel_format, self.w, self.h).with_time_base(rtp_time_base())
    }
}

/// H.264 encoder taking packed I420 pictures
pub struct FfmpegEncoder {
    encoder: video::VideoEncoder,
    frame_pool: FramePool,
    width: usize,
    height: usize,
    codec_name: String,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self> {
        if settings.layout != PixelLayout::I420 {
            bail!("encoder input must be I420, got {}", settings.layout);
        }
        let (width, height) = (settings.width as usize, settings.height as usize);
        if width % 2 != 0 || height % 2 != 0 {
            bail!("encoder needs even dimensions, got {}x{}", width, height);
        }
        let pixel_format = video::frame::get_pixel_format("yuv420p");
        let (encoder, codec_name) = Self::try_create_encoder(settings, pixel_format)?;
        info!("Using encoder: {}", codec_name);

        Ok(Self {
            encoder,
            frame_pool: FramePool::new(width, height, pixel_format),
            width,
            height,
            codec_name,
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    fn try_create_encoder(
        settings: &EncoderSettings,
        pixel_format: PixelFormat,
    ) -> Result<(video::VideoEncoder, String)> {
        let bitrate = settings.bitrate.to_string();
        let gop = (settings.framerate.num / settings.framerate.den.max(1)).max(1) * 2;
        let gop = gop.to_string();

        for (codec, options) in ENCODER_CHAIN {
            let mut builder = match video::VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(settings.width as usize)
                .height(settings.height as usize)
                .time_base(rtp_time_base())
                .set_option("b", &bitrate)
                .set_option("g", &gop);
            for (k, v) in *options {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(enc) => return Ok((enc, codec.to_string())),
                Err(e) => {
                    debug!("Encoder {} failed to initialize: {}", codec, e);
                    continue;
                }
            }
        }
        bail!("No H.264 encoder available, install FFmpeg with at least libx264 support")
    }

    fn write_i420_planes(&self, frame: &mut VideoFrameMut, picture: &[u8]) {
        let (w, h) = (self.width, self.height);
        let (cw, ch) = (w / 2, h / 2);
        let sources = [
            &picture[..w * h],
            &picture[w * h..w * h + cw * ch],
            &picture[w * h + cw * ch..],
        ];
        let mut planes = frame.planes_mut();
        for (index, (source, (pw, ph))) in sources
            .iter()
            .zip([(w, h), (cw, ch), (cw, ch)])
            .enumerate()
        {
            let plane = planes[index].data_mut();
            let line_size = plane.len() / ph;
            for r in 0..ph {
                plane[r * line_size..r * line_size + pw].copy_from_slice(&source[r * pw..(r + 1) * pw]);
            }
        }
    }

    fn drain(&mut self, out: &mut Vec<EncodedUnit>) -> Result<()> {
        while let Some(packet) = self.encoder.take()? {
            out.push(EncodedUnit {
                data: Bytes::copy_from_slice(packet.data()),
                pts: from_ffmpeg(packet.pts()),
                is_keyframe: packet.is_key(),
            });
        }
        Ok(())
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&mut self, picture: &[u8], pts: Timestamp, force_keyframe: bool) -> Result<Vec<EncodedUnit>> {
        let expected = PixelLayout::I420.frame_size(self.width as u32, self.height as u32);
        if picture.len() != expected {
            bail!("encoder expected {} bytes, got {}", expected, picture.len());
        }
        let picture_type = if force_keyframe {
            video::frame::PictureType::I
        } else {
            video::frame::PictureType::None
        };
        let mut frame = self
            .frame_pool
            .take()
            .with_pts(to_ffmpeg(pts))
            .with_picture_type(picture_type);
        self.write_i420_planes(&mut frame, picture);

        let frame = frame.freeze();
        self.encoder.push(frame.clone())?;
        self.frame_pool.put(frame);

        let mut out = Vec::new();
        self.drain(&mut out)?;
        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        if let Err(e) = self.encoder.flush() {
            warn!("Encoder {}: flush failed: {}", self.codec_name, e);
        }
        let mut out = Vec::new();
        self.drain(&mut out)?;
        Ok(out)
    }
}
