use anyhow::{Result, bail};
use log::info;

use crate::backend::DecoderFactory;
use crate::codec::{Picture, VideoDecoder};
use crate::pipeline::caps::{Caps, CapsSet, Format, FractionRange, IntRange, MediaType, PixelLayout};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{Buffer, Frame};

use super::convert;
use super::parse::h264_au_caps;

/// Largest picture dimension advertised by the decoder
pub const MAX_DIMENSION: u32 = 8192;

/// H.264 decoder stage
///
/// Pictures come out of the engine at whatever size and layout it produces;
/// they are conformed to the negotiated output format before leaving.
pub struct DecodeStage {
    factory: DecoderFactory,
    decoder: Option<Box<dyn VideoDecoder>>,
    output: Option<Format>,
    pictures: u64,
}

impl DecodeStage {
    pub fn new(factory: DecoderFactory) -> Self {
        Self {
            factory,
            decoder: None,
            output: None,
            pictures: 0,
        }
    }

    fn emit(&mut self, pictures: Vec<Picture>, keyframe_hint: bool, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(target) = &self.output else {
            bail!("decoder used before negotiation");
        };
        for picture in pictures {
            let mut source = Format::new(MediaType::RawVideo)
                .with_layout(picture.layout)
                .with_size(picture.width, picture.height);
            source.framerate = target.framerate;
            let (data, format) = convert::conform(&picture.data, &source, target)?;
            let mut frame = Frame::new(format, data, picture.pts, self.pictures);
            frame.is_keyframe = keyframe_hint;
            self.pictures += 1;
            out.push(Buffer::Frame(frame));
        }
        Ok(())
    }
}

impl Transform for DecodeStage {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn sink_caps(&self) -> CapsSet {
        h264_au_caps().into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        let mut caps = Caps::new(MediaType::RawVideo)
            .with_layouts(&[PixelLayout::I420, PixelLayout::Nv12, PixelLayout::Rgba])
            .with_size(IntRange::new(1, MAX_DIMENSION), IntRange::new(1, MAX_DIMENSION));
        if let Some(framerate) = input.and_then(|f| f.framerate) {
            caps = caps.with_framerate(FractionRange::fixed(framerate));
        }
        caps.into()
    }

    fn configure(&mut self, _input: &Format, output: &Format) -> Result<()> {
        self.output = Some(output.clone());
        Ok(())
    }

    fn change_state(&mut self, change: StateChange) -> Result<()> {
        match change {
            StateChange::ReadyToPaused => {
                self.decoder = Some((self.factory)()?);
            }
            StateChange::PausedToReady => {
                if self.decoder.take().is_some() {
                    info!("Decoder: released after {} pictures", self.pictures);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let Buffer::Frame(frame) = buffer else {
            bail!("decoder expects access units, got a {}", buffer.kind());
        };
        let Some(decoder) = self.decoder.as_mut() else {
            bail!("decoder is not open");
        };
        let pictures = decoder.decode(&frame.data, frame.pts)?;
        self.emit(pictures, frame.is_keyframe, out)
    }

    fn flush(&mut self, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        let pictures = decoder.flush()?;
        self.emit(pictures, false, out)
    }
}
