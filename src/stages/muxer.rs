use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, SelectAll};
use log::{debug, info};
use tokio::time::{Instant, sleep_until};

use crate::pipeline::batch::BatchScheduler;
use crate::pipeline::caps::{Caps, CapsSet, Format, FractionRange, IntRange, MediaType, PixelLayout};
use crate::pipeline::stage::{PipelineStage, StageContext, StageKind};
use crate::pipeline::types::{Batch, Buffer, Flow};

use super::convert;

/// Groups frames from one or more inputs into time-bounded batches
///
/// Each input pad becomes a `source_id`. Frames are scaled to the configured
/// output resolution before batching.
pub struct BatchMuxer {
    name: String,
    width: u32,
    height: u32,
    scheduler: BatchScheduler,
}

impl BatchMuxer {
    pub fn new(name: &str, width: u32, height: u32, batch_size: usize, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            scheduler: BatchScheduler::new(batch_size, timeout),
        }
    }

    async fn push_batch(&self, ctx: &StageContext, batch: Batch) -> bool {
        debug!(
            "{}: batch {} sealed with {} frames after {:?}",
            self.name,
            batch.id,
            batch.len(),
            batch.age()
        );
        ctx.health().record_batch();
        ctx.push(Buffer::Batch(batch)).await
    }
}

#[async_trait]
impl PipelineStage for BatchMuxer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Muxer
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::RawVideo)
            .with_layouts(&[PixelLayout::Nv12, PixelLayout::I420, PixelLayout::Rgba])
            .into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        let mut caps = match input.and_then(|f| f.layout) {
            Some(layout) => Caps::new(MediaType::RawVideo).with_layouts(&[layout]),
            None => self.sink_caps().first_intersection(&CapsSet::Any).unwrap_or(Caps::new(MediaType::RawVideo)),
        };
        caps = caps.with_size(IntRange::fixed(self.width), IntRange::fixed(self.height));
        if let Some(framerate) = input.and_then(|f| f.framerate) {
            caps = caps.with_framerate(FractionRange::fixed(framerate));
        }
        caps.into()
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let output = ctx
            .output_format()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;
        let inputs = ctx.take_inputs();
        if inputs.is_empty() {
            bail!("No input channel");
        }

        let mut open = inputs.len();
        let mut flows: SelectAll<_> = inputs
            .into_iter()
            .map(|input| {
                Box::pin(stream::unfold(input, |mut input| async move {
                    let pad = input.pad();
                    input.recv().await.map(|flow| ((pad, flow), input))
                }))
            })
            .collect();

        info!(
            "{}: started with {} inputs, batch size {}, timeout {:?}",
            self.name,
            open,
            self.scheduler.batch_size(),
            self.scheduler.timeout()
        );
        let mut total_frames = 0u64;
        let mut total_batches = 0u64;

        while open > 0 {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                item = flows.next() => match item {
                    Some((pad, Flow::Buffer(Buffer::Frame(mut frame)))) => {
                        let (data, format) = convert::conform(&frame.data, &frame.format, &output)?;
                        frame.data = data;
                        frame.format = format;
                        frame.source_id = pad as u32;
                        total_frames += 1;
                        for batch in self.scheduler.push(frame, Instant::now()) {
                            total_batches += 1;
                            if !self.push_batch(ctx, batch).await {
                                return Ok(());
                            }
                        }
                    }
                    Some((pad, Flow::Buffer(other))) => {
                        bail!("pad {} delivered a {}, expected frames", pad, other.kind());
                    }
                    Some((pad, Flow::Eos)) => {
                        debug!("{}: end-of-stream on pad {}", self.name, pad);
                        open -= 1;
                    }
                    None => open = 0,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.scheduler.poll_expired(Instant::now()) {
                        total_batches += 1;
                        if !self.push_batch(ctx, batch).await {
                            return Ok(());
                        }
                    }
                }
            }
        }

        if let Some(batch) = self.scheduler.flush(Instant::now()) {
            total_batches += 1;
            if !self.push_batch(ctx, batch).await {
                return Ok(());
            }
        }
        ctx.push_eos().await;

        info!(
            "{}: finished after {} frames in {} batches",
            self.name, total_frames, total_batches
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::Bus;
    use crate::pipeline::caps::{Fraction, negotiate};
    use crate::pipeline::stage::StageInput;
    use crate::testing::raw_frame_sized;
    use tokio::sync::mpsc;

    fn output_format() -> Format {
        Format::raw(PixelLayout::Nv12, 8, 4, Fraction::new(15, 1))
    }

    fn context(pads: usize) -> (StageContext, Vec<mpsc::Sender<Flow>>, mpsc::Receiver<Flow>) {
        let mut senders = Vec::new();
        let mut inputs = Vec::new();
        for pad in 0..pads {
            let (tx, rx) = mpsc::channel(16);
            senders.push(tx);
            inputs.push(StageInput::new(pad, output_format(), rx, Vec::new()));
        }
        let (out_tx, out_rx) = mpsc::channel(16);
        let (bus, _events) = Bus::new();
        let ctx = StageContext::new("mux", inputs, Some((out_tx, output_format())), bus, Default::default());
        (ctx, senders, out_rx)
    }

    fn batches(rx: &mut mpsc::Receiver<Flow>) -> (Vec<Batch>, bool) {
        let mut out = Vec::new();
        let mut eos = false;
        while let Ok(flow) = rx.try_recv() {
            match flow {
                Flow::Buffer(Buffer::Batch(batch)) => out.push(batch),
                Flow::Eos => eos = true,
                Flow::Buffer(other) => panic!("unexpected {}", other.kind()),
            }
        }
        (out, eos)
    }

    #[test]
    fn test_src_caps_follow_input_layout() {
        let muxer = BatchMuxer::new("mux", 640, 360, 1, Duration::from_secs(4));
        let input = Format::raw(PixelLayout::Nv12, 1280, 720, Fraction::new(15, 1));
        let format = negotiate(&muxer.src_caps(Some(&input)), &CapsSet::Any).unwrap();
        assert_eq!(format, Format::raw(PixelLayout::Nv12, 640, 360, Fraction::new(15, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_sealed_at_timeout() {
        let mut muxer = BatchMuxer::new("mux", 8, 4, 4, Duration::from_millis(40));
        let (mut ctx, senders, mut out) = context(1);
        let tx = senders[0].clone();

        let feeder = tokio::spawn(async move {
            for n in 0..3 {
                tx.send(Flow::Buffer(Buffer::Frame(raw_frame_sized(n, 8, 4)))).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            tx.send(Flow::Buffer(Buffer::Frame(raw_frame_sized(3, 8, 4)))).await.unwrap();
            tx.send(Flow::Eos).await.unwrap();
        });
        drop(senders);

        muxer.run(&mut ctx).await.unwrap();
        feeder.await.unwrap();

        let (batches, eos) = batches(&mut out);
        assert!(eos);
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![3, 1]);
        assert!(batches[0].age() <= Duration::from_millis(40));
        assert_eq!(batches[0].frames[2].frame_num, 2);
    }

    #[tokio::test]
    async fn test_eos_waits_for_every_pad_and_scales() {
        let mut muxer = BatchMuxer::new("mux", 8, 4, 2, Duration::from_secs(4));
        let (mut ctx, senders, mut out) = context(2);

        // pad 1 carries larger frames which must come out at 8x4
        senders[0].send(Flow::Buffer(Buffer::Frame(raw_frame_sized(0, 8, 4)))).await.unwrap();
        senders[0].send(Flow::Eos).await.unwrap();
        senders[1].send(Flow::Buffer(Buffer::Frame(raw_frame_sized(0, 16, 8)))).await.unwrap();
        senders[1].send(Flow::Buffer(Buffer::Frame(raw_frame_sized(1, 16, 8)))).await.unwrap();
        senders[1].send(Flow::Eos).await.unwrap();
        drop(senders);

        muxer.run(&mut ctx).await.unwrap();
        let (batches, eos) = batches(&mut out);
        assert!(eos);
        let frames: Vec<_> = batches.iter().flat_map(|b| b.frames.iter()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.size() == PixelLayout::Nv12.frame_size(8, 4)));
        assert_eq!(frames.iter().filter(|f| f.source_id == 1).count(), 2);
    }
}
