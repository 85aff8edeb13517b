//! Fake stages and engines shared by the unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::{EncodedUnit, Picture, VideoDecoder, VideoEncoder};
use crate::detect::Detector;
use crate::h264::START_CODE;
use crate::pipeline::caps::{CapsSet, Format, Fraction, PixelLayout};
use crate::pipeline::stage::{PipelineStage, StageContext, StageKind};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{BBox, Batch, Buffer, Detection, Flow, Frame, Timestamp};

/// A raw 4x2 NV12 frame numbered `n`
pub fn raw_frame(n: u64) -> Frame {
    raw_frame_sized(n, 4, 2)
}

/// A raw NV12 frame of the given size, stamped at 15 fps
pub fn raw_frame_sized(n: u64, width: u32, height: u32) -> Frame {
    let format = Format::raw(PixelLayout::Nv12, width, height, Fraction::new(15, 1));
    let data = vec![(n % 256) as u8; PixelLayout::Nv12.frame_size(width, height)];
    Frame::new(format, Bytes::from(data), Timestamp::from_micros(n as i64 * 66_666), n)
}

/// Source emitting a fixed list of frames, then end-of-stream
pub struct VecSource {
    name: String,
    caps: CapsSet,
    frames: Vec<Frame>,
    hold_open: bool,
    interval: Option<Duration>,
    fail_on_pause: bool,
}

impl VecSource {
    pub fn new(name: &str, caps: CapsSet, frames: Vec<Frame>) -> Self {
        Self {
            name: name.to_string(),
            caps,
            frames,
            hold_open: false,
            interval: None,
            fail_on_pause: false,
        }
    }

    /// Stay alive after the last frame instead of sending end-of-stream
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Sleep between frames
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Refuse the Ready -> Paused step
    pub fn fail_on_pause(mut self) -> Self {
        self.fail_on_pause = true;
        self
    }
}

#[async_trait]
impl PipelineStage for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn sink_caps(&self) -> CapsSet {
        CapsSet::Structures(Vec::new())
    }

    fn src_caps(&self, _input: Option<&Format>) -> CapsSet {
        self.caps.clone()
    }

    async fn change_state(&mut self, change: StateChange) -> Result<()> {
        if self.fail_on_pause && change == StateChange::ReadyToPaused {
            bail!("device not reachable");
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        for (i, frame) in std::mem::take(&mut self.frames).into_iter().enumerate() {
            if i > 0 {
                if let Some(interval) = self.interval {
                    tokio::time::sleep(interval).await;
                }
            }
            if !ctx.push(Buffer::Frame(frame)).await {
                return Ok(());
            }
        }
        if self.hold_open {
            std::future::pending::<()>().await;
        }
        ctx.push_eos().await;
        Ok(())
    }
}

/// Every state change a stage was asked to make, in order
pub type ChangeLog = Arc<Mutex<Vec<StateChange>>>;

/// Forwards everything unchanged
pub struct PassthroughStage {
    name: String,
    caps: CapsSet,
    changes: ChangeLog,
}

impl PassthroughStage {
    pub fn new(name: &str, caps: CapsSet) -> Self {
        Self {
            name: name.to_string(),
            caps,
            changes: ChangeLog::default(),
        }
    }

    /// Record state changes into `log`
    pub fn with_log(mut self, log: ChangeLog) -> Self {
        self.changes = log;
        self
    }
}

#[async_trait]
impl PipelineStage for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn sink_caps(&self) -> CapsSet {
        self.caps.clone()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        match input {
            Some(format) => crate::pipeline::caps::Caps::from_format(format).into(),
            None => self.caps.clone(),
        }
    }

    async fn change_state(&mut self, change: StateChange) -> Result<()> {
        self.changes.lock().unwrap().push(change);
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        while let Some(flow) = ctx.recv().await {
            match flow {
                Flow::Buffer(buffer) => {
                    if !ctx.push(buffer).await {
                        return Ok(());
                    }
                }
                Flow::Eos => {
                    ctx.push_eos().await;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Fails when the given (zero-based) buffer arrives
pub struct FailingStage {
    inner: PassthroughStage,
    fail_at: u64,
}

impl FailingStage {
    pub fn new(name: &str, caps: CapsSet, fail_at: u64) -> Self {
        Self {
            inner: PassthroughStage::new(name, caps),
            fail_at,
        }
    }
}

#[async_trait]
impl PipelineStage for FailingStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn sink_caps(&self) -> CapsSet {
        self.inner.sink_caps()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        self.inner.src_caps(input)
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let mut seen = 0u64;
        while let Some(flow) = ctx.recv().await {
            match flow {
                Flow::Buffer(_) if seen == self.fail_at => bail!("failed on buffer {}", seen),
                Flow::Buffer(buffer) => {
                    seen += 1;
                    ctx.push(buffer).await;
                }
                Flow::Eos => {
                    ctx.push_eos().await;
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Sink handing every buffer to the test
pub struct ChannelSink {
    name: String,
    caps: CapsSet,
    tx: mpsc::UnboundedSender<Buffer>,
}

impl ChannelSink {
    pub fn new(name: &str, caps: CapsSet) -> (Self, mpsc::UnboundedReceiver<Buffer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.to_string(),
                caps,
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl PipelineStage for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn sink_caps(&self) -> CapsSet {
        self.caps.clone()
    }

    fn src_caps(&self, _input: Option<&Format>) -> CapsSet {
        CapsSet::Structures(Vec::new())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        while let Some(flow) = ctx.recv().await {
            match flow {
                Flow::Buffer(buffer) => {
                    let _ = self.tx.send(buffer);
                }
                Flow::Eos => break,
            }
        }
        Ok(())
    }
}

/// Decoder producing one grey I420 picture per access unit
pub struct FakeDecoder {
    width: u32,
    height: u32,
}

impl FakeDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl VideoDecoder for FakeDecoder {
    fn decode(&mut self, _access_unit: &[u8], pts: Timestamp) -> Result<Vec<Picture>> {
        Ok(vec![Picture {
            layout: PixelLayout::I420,
            width: self.width,
            height: self.height,
            data: Bytes::from(vec![128u8; PixelLayout::I420.frame_size(self.width, self.height)]),
            pts,
        }])
    }

    fn flush(&mut self) -> Result<Vec<Picture>> {
        Ok(Vec::new())
    }
}

/// Encoder emitting a small Annex B access unit per picture
///
/// Keyframes carry an SPS and PPS ahead of the IDR slice.
#[derive(Default)]
pub struct FakeEncoder;

impl FakeEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl VideoEncoder for FakeEncoder {
    fn encode(&mut self, picture: &[u8], pts: Timestamp, force_keyframe: bool) -> Result<Vec<EncodedUnit>> {
        let mut au = Vec::new();
        if force_keyframe {
            au.extend_from_slice(&START_CODE);
            au.extend_from_slice(&[0x67, 0x42, 0x00, 0x1e]);
            au.extend_from_slice(&START_CODE);
            au.extend_from_slice(&[0x68, 0xce, 0x3c, 0x80]);
        }
        au.extend_from_slice(&START_CODE);
        au.push(if force_keyframe { 0x65 } else { 0x41 });
        au.push(0x88);
        au.extend_from_slice(&(picture.len() as u32).to_be_bytes());
        Ok(vec![EncodedUnit {
            data: Bytes::from(au),
            pts,
            is_keyframe: force_keyframe,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        Ok(Vec::new())
    }
}

/// Detector reporting a fixed set of objects on every frame
pub struct FakeDetector {
    per_frame: Vec<(u32, usize)>,
    failure: Option<String>,
}

impl FakeDetector {
    /// `(class_id, count)` pairs reported for each frame
    pub fn per_frame(per_frame: Vec<(u32, usize)>) -> Self {
        Self {
            per_frame,
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            per_frame: Vec::new(),
            failure: Some(message.to_string()),
        }
    }
}

impl Detector for FakeDetector {
    fn detect(&mut self, batch: &Batch) -> Result<Vec<Vec<Detection>>> {
        if let Some(message) = &self.failure {
            bail!("{}", message);
        }
        let detections: Vec<Detection> = self
            .per_frame
            .iter()
            .flat_map(|(class_id, count)| {
                (0..*count).map(move |i| Detection {
                    class_id: *class_id,
                    bbox: BBox {
                        left: 2.0 + i as f32 * 20.0,
                        top: 40.0,
                        width: 16.0,
                        height: 16.0,
                    },
                    confidence: 0.8,
                })
            })
            .collect();
        Ok(vec![detections; batch.len()])
    }
}
