//! Codecs backed by an `ffmpeg` executable on the PATH
//!
//! Access units go in through the child's stdin and results are read back on
//! a helper thread, so the pipeline never waits on the child's output pipe.
//! Decoded pictures travel as YUV4MPEG2, which carries its own picture size.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::{debug, info, warn};

use crate::h264::{self, AccessUnitSplitter};
use crate::pipeline::caps::PixelLayout;
use crate::pipeline::types::Timestamp;

use super::{EncodedUnit, EncoderSettings, Picture, VideoDecoder, VideoEncoder};

pub const PROGRAM: &str = "ffmpeg";

const READ_CHUNK: usize = 64 * 1024;

/// Child process with a writable stdin and a thread draining its stdout
struct Pipe<T> {
    child: Child,
    stdin: Option<ChildStdin>,
    results: Receiver<Result<T>>,
}

impl<T: Send + 'static> Pipe<T> {
    fn spawn<F>(mut cmd: Command, reader: F) -> Result<Self>
    where
        F: FnOnce(Box<dyn Read + Send>, Sender<Result<T>>) -> Result<()> + Send + 'static,
    {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::inherit());
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd.spawn().with_context(|| format!("failed to start {}", program))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture {} stdout", program))?;
        let stdin = child.stdin.take();

        let (tx, rx) = unbounded();
        thread::spawn(move || {
            if let Err(err) = reader(Box::new(stdout), tx.clone()) {
                let _ = tx.send(Err(err));
            }
        });

        Ok(Self {
            child,
            stdin,
            results: rx,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            bail!("codec input already closed");
        };
        stdin.write_all(data).context("codec process stopped accepting input")
    }

    /// Everything the child has produced so far
    fn ready(&mut self) -> Result<Vec<T>> {
        let mut out = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(item) => out.push(item?),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Ok(out),
            }
        }
    }

    /// Close stdin and collect output until the child exits
    fn finish(&mut self) -> Result<Vec<T>> {
        drop(self.stdin.take());
        let mut out = Vec::new();
        while let Ok(item) = self.results.recv() {
            out.push(item?);
        }
        let status = self.child.wait().context("failed to reap codec process")?;
        if !status.success() {
            warn!("Codec: {} exited with {}", PROGRAM, status);
        }
        Ok(out)
    }
}

impl<T> Drop for Pipe<T> {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn base_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-nostdin")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay");
    cmd
}

/// H.264 decoder writing I420 pictures as YUV4MPEG2
pub struct CliDecoder {
    pipe: Pipe<Picture>,
    pending: VecDeque<Timestamp>,
}

impl CliDecoder {
    pub fn new() -> Result<Self> {
        Self::with_program(PROGRAM)
    }

    pub fn with_program(program: &str) -> Result<Self> {
        let mut cmd = base_command(program);
        cmd.arg("-f")
            .arg("h264")
            .arg("-i")
            .arg("pipe:0")
            .arg("-an")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-f")
            .arg("yuv4mpegpipe")
            .arg("pipe:1");
        let pipe = Pipe::spawn(cmd, |stdout, tx| read_y4m(BufReader::new(stdout), &tx))?;
        info!("Decoder: started {} subprocess", program);
        Ok(Self {
            pipe,
            pending: VecDeque::new(),
        })
    }

    /// Pictures come back in submission order; stamp them in that order
    fn stamp(&mut self, pictures: Vec<Picture>) -> Vec<Picture> {
        pictures
            .into_iter()
            .map(|mut picture| {
                picture.pts = self.pending.pop_front().unwrap_or(picture.pts);
                picture
            })
            .collect()
    }
}

impl VideoDecoder for CliDecoder {
    fn decode(&mut self, access_unit: &[u8], pts: Timestamp) -> Result<Vec<Picture>> {
        self.pending.push_back(pts);
        self.pipe.write(access_unit)?;
        let pictures = self.pipe.ready()?;
        Ok(self.stamp(pictures))
    }

    fn flush(&mut self) -> Result<Vec<Picture>> {
        let pictures = self.pipe.finish()?;
        debug!("Decoder: {} pictures left at end of stream", pictures.len());
        Ok(self.stamp(pictures))
    }
}

/// Parse a YUV4MPEG2 stream of 4:2:0 pictures
fn read_y4m<R: BufRead>(mut input: R, tx: &Sender<Result<Picture>>) -> Result<()> {
    let mut line = Vec::new();
    if input.read_until(b'\n', &mut line)? == 0 {
        return Ok(());
    }
    let (width, height) = parse_y4m_header(&line)?;
    let size = PixelLayout::I420.frame_size(width, height);

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        if !line.starts_with(b"FRAME") {
            bail!("malformed picture marker in decoder output");
        }
        let mut data = vec![0u8; size];
        input.read_exact(&mut data).context("truncated picture in decoder output")?;
        let picture = Picture {
            layout: PixelLayout::I420,
            width,
            height,
            data: Bytes::from(data),
            pts: Timestamp::default(),
        };
        if tx.send(Ok(picture)).is_err() {
            return Ok(());
        }
    }
}

fn parse_y4m_header(line: &[u8]) -> Result<(u32, u32)> {
    let header = std::str::from_utf8(line).context("decoder output header is not text")?;
    let mut fields = header.split_ascii_whitespace();
    if fields.next() != Some("YUV4MPEG2") {
        bail!("decoder output is not YUV4MPEG2");
    }
    let (mut width, mut height) = (None, None);
    for field in fields {
        match field.split_at_checked(1) {
            Some(("W", value)) => width = value.parse::<u32>().ok(),
            Some(("H", value)) => height = value.parse::<u32>().ok(),
            Some(("C", chroma)) if !chroma.starts_with("420") => bail!("unsupported chroma {}", chroma),
            _ => {}
        }
    }
    match (width, height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => bail!("decoder output header has no picture size"),
    }
}

/// x264 encoder reading raw pictures and writing an Annex B stream
pub struct CliEncoder {
    pipe: Pipe<Bytes>,
    pending: VecDeque<Timestamp>,
    frame_size: usize,
}

impl CliEncoder {
    pub fn new(settings: &EncoderSettings) -> Result<Self> {
        Self::with_program(PROGRAM, settings)
    }

    pub fn with_program(program: &str, settings: &EncoderSettings) -> Result<Self> {
        let framerate = settings.framerate;
        if framerate.num == 0 || framerate.den == 0 {
            bail!("encoder needs a non-zero framerate");
        }
        let gop = framerate.num.div_ceil(framerate.den).max(1);

        let mut cmd = base_command(program);
        cmd.arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg(raw_pix_fmt(settings.layout))
            .arg("-s")
            .arg(format!("{}x{}", settings.width, settings.height))
            .arg("-r")
            .arg(format!("{}/{}", framerate.num, framerate.den))
            .arg("-i")
            .arg("pipe:0")
            .arg("-an")
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("ultrafast")
            .arg("-tune")
            .arg("zerolatency")
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-b:v")
            .arg(settings.bitrate.to_string())
            .arg("-g")
            .arg(gop.to_string())
            .arg("-bf")
            .arg("0")
            .arg("-x264-params")
            .arg("repeat-headers=1")
            .arg("-f")
            .arg("h264")
            .arg("pipe:1");

        let pipe = Pipe::spawn(cmd, |stdout, tx| split_access_units(stdout, &tx))?;
        info!(
            "Encoder: started {} subprocess for {}x{} {} at {} bps",
            program,
            settings.width,
            settings.height,
            settings.layout.as_str(),
            settings.bitrate
        );
        Ok(Self {
            pipe,
            pending: VecDeque::new(),
            frame_size: settings.layout.frame_size(settings.width, settings.height),
        })
    }

    fn stamp(&mut self, units: Vec<Bytes>) -> Vec<EncodedUnit> {
        units
            .into_iter()
            .map(|data| EncodedUnit {
                pts: self.pending.pop_front().unwrap_or_default(),
                is_keyframe: h264::contains_idr(&data),
                data,
            })
            .collect()
    }
}

impl VideoEncoder for CliEncoder {
    /// The process opens on an IDR and repeats one every second; a forced
    /// keyframe later in the stream waits for the next one.
    fn encode(&mut self, picture: &[u8], pts: Timestamp, _force_keyframe: bool) -> Result<Vec<EncodedUnit>> {
        if picture.len() != self.frame_size {
            bail!("encoder got {} bytes, expected {}", picture.len(), self.frame_size);
        }
        self.pending.push_back(pts);
        self.pipe.write(picture)?;
        let units = self.pipe.ready()?;
        Ok(self.stamp(units))
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        let units = self.pipe.finish()?;
        Ok(self.stamp(units))
    }
}

fn raw_pix_fmt(layout: PixelLayout) -> &'static str {
    match layout {
        PixelLayout::Nv12 => "nv12",
        PixelLayout::I420 => "yuv420p",
        PixelLayout::Rgba => "rgba",
    }
}

fn split_access_units<R: Read>(mut input: R, tx: &Sender<Result<Bytes>>) -> Result<()> {
    let mut splitter = AccessUnitSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = input.read(&mut chunk).context("failed to read encoder output")?;
        let units = if n == 0 { splitter.flush() } else { splitter.push(&chunk[..n]) };
        for unit in units {
            if tx.send(Ok(unit)).is_err() {
                return Ok(());
            }
        }
        if n == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::Fraction;
    use std::io::Cursor;

    #[test]
    fn test_y4m_pictures() {
        let mut stream = b"YUV4MPEG2 W4 H2 F30:1 Ip A1:1 C420jpeg XYSCSS=420JPEG\n".to_vec();
        for value in [16u8, 235] {
            stream.extend_from_slice(b"FRAME\n");
            stream.extend(std::iter::repeat_n(value, PixelLayout::I420.frame_size(4, 2)));
        }

        let (tx, rx) = unbounded();
        read_y4m(Cursor::new(stream), &tx).unwrap();
        drop(tx);
        let pictures: Vec<Picture> = rx.iter().map(|p| p.unwrap()).collect();
        assert_eq!(pictures.len(), 2);
        assert_eq!((pictures[0].width, pictures[0].height), (4, 2));
        assert_eq!(pictures[0].data.len(), 12);
        assert_eq!(pictures[1].data[0], 235);
    }

    #[test]
    fn test_y4m_rejects_garbage() {
        assert!(parse_y4m_header(b"RIFF\n").is_err());
        assert!(parse_y4m_header(b"YUV4MPEG2 W4\n").is_err());
        assert!(parse_y4m_header(b"YUV4MPEG2 W4 H2 C444\n").is_err());

        let mut stream = b"YUV4MPEG2 W2 H2\nFRAME\n".to_vec();
        stream.extend_from_slice(&[0, 0]);
        let (tx, _rx) = unbounded();
        assert!(read_y4m(Cursor::new(stream), &tx).is_err());
    }

    #[test]
    fn test_encoder_output_split_per_picture() {
        let mut stream = Vec::new();
        for nal in [&[0x67u8, 0x42][..], &[0x68, 0xce], &[0x65, 0x88], &[0x41, 0x9a], &[0x41, 0x9b]] {
            stream.extend_from_slice(&h264::START_CODE);
            stream.extend_from_slice(nal);
        }

        let (tx, rx) = unbounded();
        split_access_units(Cursor::new(stream), &tx).unwrap();
        drop(tx);
        let units: Vec<Bytes> = rx.iter().map(|u| u.unwrap()).collect();
        assert_eq!(units.len(), 3);
        assert!(h264::contains_idr(&units[0]));
        assert!(!h264::contains_idr(&units[2]));
    }

    #[test]
    fn test_missing_program() {
        let err = CliDecoder::with_program("/nonexistent/ffmpeg").err().unwrap();
        assert!(err.to_string().contains("failed to start"), "{}", err);

        let settings = EncoderSettings {
            layout: PixelLayout::I420,
            width: 64,
            height: 64,
            framerate: Fraction::new(0, 1),
            bitrate: 1_000_000,
        };
        assert!(CliEncoder::with_program("/nonexistent/ffmpeg", &settings).is_err());
    }
}
