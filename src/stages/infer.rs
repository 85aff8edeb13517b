use anyhow::{Result, bail};
use log::debug;
use tokio::time::Instant;

use crate::backend::DetectorFactory;
use crate::detect::Detector;
use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType};
use crate::pipeline::registry::StageConfig;
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{Batch, BatchInfo, Buffer};

/// Runs the detector over each batch and attaches its results
///
/// Batches are unpacked on the way out: every frame leaves on its own,
/// tagged with the batch it was inferred in.
pub struct InferStage {
    factory: DetectorFactory,
    config: StageConfig,
    detector: Option<Box<dyn Detector>>,
    batches: u64,
}

impl InferStage {
    pub fn new(factory: DetectorFactory, config: StageConfig) -> Self {
        Self {
            factory,
            config,
            detector: None,
            batches: 0,
        }
    }

    fn infer(&mut self, mut batch: Batch, out: &mut Vec<Buffer>) -> Result<()> {
        let Some(detector) = self.detector.as_mut() else {
            bail!("detector is not loaded");
        };
        let results = detector.detect(&batch)?;
        if results.len() != batch.len() {
            bail!(
                "detector returned {} results for a batch of {}",
                results.len(),
                batch.len()
            );
        }
        self.batches += 1;

        let len = batch.len();
        for (index, (mut frame, detections)) in batch.frames.drain(..).zip(results).enumerate() {
            frame.detections = detections;
            frame.batch = Some(BatchInfo {
                batch_id: batch.id,
                index,
                len,
            });
            out.push(Buffer::Frame(frame));
        }
        Ok(())
    }
}

impl Transform for InferStage {
    fn kind(&self) -> StageKind {
        StageKind::Annotator
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::RawVideo).into()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        match input {
            Some(format) => Caps::from_format(format).into(),
            None => self.sink_caps(),
        }
    }

    fn change_state(&mut self, change: StateChange) -> Result<()> {
        match change {
            StateChange::ReadyToPaused => {
                self.detector = Some((self.factory)(&self.config)?);
            }
            StateChange::PausedToReady => {
                self.detector = None;
                debug!("{}: detector unloaded after {} batches", self.config.name, self.batches);
            }
            _ => {}
        }
        Ok(())
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        match buffer {
            Buffer::Batch(batch) => self.infer(batch, out),
            Buffer::Frame(frame) => {
                let now = Instant::now();
                let batch = Batch {
                    id: self.batches,
                    frames: vec![frame],
                    opened_at: now,
                    deadline: now,
                    sealed_at: now,
                };
                self.infer(batch, out)
            }
            Buffer::Packet(_) => bail!("inference cannot run on packets"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDetector, raw_frame};
    use std::sync::Arc;

    fn stage(detector: FakeDetector) -> InferStage {
        let detector = std::sync::Mutex::new(Some(detector));
        let factory: DetectorFactory = Arc::new(move |_| {
            let d = detector.lock().unwrap().take().unwrap();
            Ok(Box::new(d) as Box<dyn Detector>)
        });
        InferStage::new(factory, StageConfig::new("infer", StageKind::Annotator, "infer"))
    }

    #[tokio::test]
    async fn test_batch_unpacked_with_detections() {
        let mut infer = stage(FakeDetector::per_frame(vec![(2, 1), (0, 2)]));
        infer.change_state(StateChange::ReadyToPaused).unwrap();

        let now = Instant::now();
        let batch = Batch {
            id: 7,
            frames: (0..3).map(raw_frame).collect(),
            opened_at: now,
            deadline: now,
            sealed_at: now,
        };
        let mut out = Vec::new();
        infer.transform(Buffer::Batch(batch), &mut out).unwrap();

        assert_eq!(out.len(), 3);
        for (index, buffer) in out.iter().enumerate() {
            let Buffer::Frame(frame) = buffer else {
                panic!("expected frames");
            };
            assert_eq!(frame.batch, Some(BatchInfo { batch_id: 7, index, len: 3 }));
            assert_eq!(frame.detections.len(), 3);
            assert_eq!(frame.detections.iter().filter(|d| d.class_id == 0).count(), 2);
        }
    }

    #[tokio::test]
    async fn test_detector_failure_propagates() {
        let mut infer = stage(FakeDetector::failing("model exploded"));
        infer.change_state(StateChange::ReadyToPaused).unwrap();
        let err = infer.transform(Buffer::Frame(raw_frame(0)), &mut Vec::new()).unwrap_err();
        assert!(err.to_string().contains("model exploded"));
    }
}
