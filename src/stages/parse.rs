use anyhow::{Result, bail};

use crate::h264::{self, AccessUnitSplitter};
use crate::pipeline::caps::{Caps, CapsSet, Format, Fraction, FractionRange, MediaType};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::types::{Buffer, Frame, Timestamp};

/// Caps of an access-unit aligned Annex B stream
pub fn h264_au_caps() -> Caps {
    Caps::new(MediaType::H264)
        .with_param("stream-format", "byte-stream")
        .with_param("alignment", "au")
}

/// Splits a raw H.264 byte stream into access units
///
/// The ingest stream carries no timing, so access units are stamped at the
/// configured frame rate.
pub struct H264Parser {
    framerate: Fraction,
    splitter: AccessUnitSplitter,
    output: Option<Format>,
    units: u64,
}

impl H264Parser {
    pub fn new(framerate: Fraction) -> Self {
        Self {
            framerate,
            splitter: AccessUnitSplitter::new(),
            output: None,
            units: 0,
        }
    }

    fn emit(&mut self, data: bytes::Bytes, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(format) = &self.output else {
            bail!("parser used before negotiation");
        };
        let pts = Timestamp::from_micros(self.units as i64 * self.framerate.frame_duration_micros());
        let mut frame = Frame::new(format.clone(), data, pts, self.units);
        frame.is_keyframe = h264::contains_idr(&frame.data);
        self.units += 1;
        out.push(Buffer::Frame(frame));
        Ok(())
    }
}

impl Transform for H264Parser {
    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn sink_caps(&self) -> CapsSet {
        CapsSet::Structures(vec![
            Caps::new(MediaType::ByteStream),
            Caps::new(MediaType::H264).with_param("stream-format", "byte-stream"),
        ])
    }

    fn src_caps(&self, _input: Option<&Format>) -> CapsSet {
        h264_au_caps()
            .with_framerate(FractionRange::fixed(self.framerate))
            .into()
    }

    fn configure(&mut self, _input: &Format, output: &Format) -> Result<()> {
        self.output = Some(output.clone());
        Ok(())
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let Buffer::Frame(chunk) = buffer else {
            bail!("parser expects byte-stream chunks, got a {}", buffer.kind());
        };
        for au in self.splitter.push(&chunk.data) {
            self.emit(au, out)?;
        }
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<Buffer>) -> Result<()> {
        for au in self.splitter.flush() {
            self.emit(au, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h264::tests::access_unit;
    use bytes::Bytes;

    #[test]
    fn test_parser_stamps_access_units() {
        let mut parser = H264Parser::new(Fraction::new(15, 1));
        let output = parser.src_caps(None).first_intersection(&CapsSet::Any).unwrap().fixate();
        parser.configure(&Format::new(MediaType::ByteStream), &output).unwrap();

        let stream: Vec<u8> = (0..4).map(|i| access_unit(i == 0, 30)).collect::<Vec<_>>().concat();
        let mut out = Vec::new();
        for chunk in stream.chunks(25) {
            let frame = Frame::new(
                Format::new(MediaType::ByteStream),
                Bytes::copy_from_slice(chunk),
                Timestamp::default(),
                0,
            );
            parser.transform(Buffer::Frame(frame), &mut out).unwrap();
        }
        parser.flush(&mut out).unwrap();

        assert_eq!(out.len(), 4);
        let frames: Vec<_> = out
            .into_iter()
            .map(|b| match b {
                Buffer::Frame(f) => f,
                other => panic!("unexpected {}", other.kind()),
            })
            .collect();
        assert!(frames[0].is_keyframe);
        assert!(!frames[1].is_keyframe);
        assert_eq!(frames[1].pts, Timestamp::from_micros(66_666));
        assert_eq!(frames[3].frame_num, 3);
        assert_eq!(frames[0].format.media, MediaType::H264);
    }
}
