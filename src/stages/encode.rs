use anyhow::{Result, bail};
use log::info;

use crate::backend::EncoderFactory;
use crate::codec::{EncodedUnit, EncoderSettings, VideoEncoder};
use crate::pipeline::caps::{Caps, CapsSet, Format, Fraction, FractionRange, IntRange, MediaType, PixelLayout};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{Buffer, Frame};

use super::parse::h264_au_caps;

/// H.264 encoder stage
pub struct EncodeStage {
    factory: EncoderFactory,
    bitrate: u32,
    settings: Option<EncoderSettings>,
    output: Option<Format>,
    encoder: Option<Box<dyn VideoEncoder>>,
    frames_in: u64,
    units_out: u64,
}

impl EncodeStage {
    pub fn new(factory: EncoderFactory, bitrate: u32) -> Self {
        Self {
            factory,
            bitrate,
            settings: None,
            output: None,
            encoder: None,
            frames_in: 0,
            units_out: 0,
        }
    }

    fn emit(&mut self, units: Vec<EncodedUnit>, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(format) = &self.output else {
            bail!("encoder used before negotiation");
        };
        for unit in units {
            let mut frame = Frame::new(format.clone(), unit.data, unit.pts, self.units_out);
            frame.is_keyframe = unit.is_keyframe;
            self.units_out += 1;
            out.push(Buffer::Frame(frame));
        }
        Ok(())
    }
}

impl Transform for EncodeStage {
    fn kind(&self) -> StageKind {
        StageKind::Encoder
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::RawVideo)
            .with_layouts(&[PixelLayout::I420])
            .with_size(IntRange::new(2, 8192), IntRange::new(2, 8192))
            .into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        let mut caps = h264_au_caps();
        if let Some(input) = input {
            if let (Some(w), Some(h)) = (input.width, input.height) {
                caps = caps.with_size(IntRange::fixed(w), IntRange::fixed(h));
            }
            if let Some(framerate) = input.framerate {
                caps = caps.with_framerate(FractionRange::fixed(framerate));
            }
        }
        caps.into()
    }

    fn configure(&mut self, input: &Format, output: &Format) -> Result<()> {
        let (Some(width), Some(height)) = (input.width, input.height) else {
            bail!("encoder input [{}] has no size", input);
        };
        self.settings = Some(EncoderSettings {
            layout: input.layout.unwrap_or(PixelLayout::I420),
            width,
            height,
            framerate: input.framerate.unwrap_or(Fraction::new(30, 1)),
            bitrate: self.bitrate,
        });
        self.output = Some(output.clone());
        Ok(())
    }

    fn change_state(&mut self, change: StateChange) -> Result<()> {
        match change {
            StateChange::ReadyToPaused => {
                let Some(settings) = &self.settings else {
                    bail!("encoder opened before negotiation");
                };
                self.encoder = Some((self.factory)(settings)?);
            }
            StateChange::PausedToReady => {
                if self.encoder.take().is_some() {
                    info!(
                        "Encoder: released after {} frames in, {} units out",
                        self.frames_in, self.units_out
                    );
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let Buffer::Frame(frame) = buffer else {
            bail!("encoder expects frames, got a {}", buffer.kind());
        };
        let Some(encoder) = self.encoder.as_mut() else {
            bail!("encoder is not open");
        };
        // start the stream on a keyframe so late viewers can join
        let force_keyframe = self.frames_in == 0;
        self.frames_in += 1;
        let units = encoder.encode(&frame.data, frame.pts, force_keyframe)?;
        self.emit(units, out)
    }

    fn flush(&mut self, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let units = encoder.flush()?;
        self.emit(units, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::negotiate;
    use crate::pipeline::types::Timestamp;
    use crate::testing::FakeEncoder;
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_encoder_opened_with_negotiated_settings() {
        let seen = Arc::new(Mutex::new(None));
        let recorder = seen.clone();
        let factory: EncoderFactory = Arc::new(move |settings: &EncoderSettings| {
            *recorder.lock().unwrap() = Some(settings.clone());
            Ok(Box::new(FakeEncoder::new()) as Box<dyn VideoEncoder>)
        });
        let mut stage = EncodeStage::new(factory, 4_000_000);

        let input = Format::raw(PixelLayout::I420, 640, 360, Fraction::new(15, 1));
        let output = negotiate(&stage.src_caps(Some(&input)), &CapsSet::Any).unwrap();
        assert_eq!(output.width, Some(640));
        assert_eq!(output.media, MediaType::H264);

        stage.configure(&input, &output).unwrap();
        stage.change_state(StateChange::ReadyToPaused).unwrap();
        assert_eq!(
            seen.lock().unwrap().clone().unwrap(),
            EncoderSettings {
                layout: PixelLayout::I420,
                width: 640,
                height: 360,
                framerate: Fraction::new(15, 1),
                bitrate: 4_000_000,
            }
        );

        let mut out = Vec::new();
        for n in 0..3 {
            let data = Bytes::from(vec![0u8; PixelLayout::I420.frame_size(640, 360)]);
            let frame = Frame::new(input.clone(), data, Timestamp::from_micros(n * 66_666), n as u64);
            stage.transform(Buffer::Frame(frame), &mut out).unwrap();
        }
        let keyframes: Vec<bool> = out
            .iter()
            .map(|b| matches!(b, Buffer::Frame(f) if f.is_keyframe))
            .collect();
        assert_eq!(keyframes, vec![true, false, false]);
    }

    #[test]
    fn test_rejects_non_i420_input() {
        let stage = EncodeStage::new(Arc::new(|_: &EncoderSettings| Ok(Box::new(FakeEncoder::new()) as Box<dyn VideoEncoder>)), 1);
        let rgba: CapsSet = "video/x-raw, format=RGBA".parse().unwrap();
        assert!(negotiate(&rgba, &stage.sink_caps()).is_none());
    }
}
