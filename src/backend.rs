//! Named codec and detector engines available to stage factories

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use crate::codec::cli::{CliDecoder, CliEncoder};
use crate::codec::{EncoderSettings, VideoDecoder, VideoEncoder};
use crate::detect::{Detector, NullDetector};
use crate::error::ConstructionError;
use crate::pipeline::registry::StageConfig;

pub type DecoderFactory = Arc<dyn Fn() -> Result<Box<dyn VideoDecoder>> + Send + Sync>;
pub type EncoderFactory = Arc<dyn Fn(&EncoderSettings) -> Result<Box<dyn VideoEncoder>> + Send + Sync>;
pub type DetectorFactory = Arc<dyn Fn(&StageConfig) -> Result<Box<dyn Detector>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Backends {
    decoders: HashMap<String, DecoderFactory>,
    encoders: HashMap<String, EncoderFactory>,
    detectors: HashMap<String, DetectorFactory>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engines compiled into this binary
    pub fn builtin() -> Self {
        let mut backends = Self::new();
        backends.register_detector("none", |_| Ok(Box::new(NullDetector)));
        backends.register_decoder("ffmpeg-cli", || Ok(Box::new(CliDecoder::new()?)));
        backends.register_encoder("ffmpeg-cli", |settings| Ok(Box::new(CliEncoder::new(settings)?)));

        #[cfg(feature = "ffmpeg")]
        {
            use crate::codec::ffmpeg::{FfmpegDecoder, FfmpegEncoder};
            backends.register_decoder("ffmpeg", || Ok(Box::new(FfmpegDecoder::new()?)));
            backends.register_encoder("ffmpeg", |settings| Ok(Box::new(FfmpegEncoder::new(settings)?)));
        }

        backends
    }

    pub fn register_decoder<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn VideoDecoder>> + Send + Sync + 'static,
    {
        self.decoders.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_encoder<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&EncoderSettings) -> Result<Box<dyn VideoEncoder>> + Send + Sync + 'static,
    {
        self.encoders.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_detector<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StageConfig) -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        self.detectors.insert(name.to_string(), Arc::new(factory));
    }

    pub fn decoder(&self, stage: &str, name: &str) -> Result<DecoderFactory, ConstructionError> {
        self.decoders.get(name).cloned().ok_or_else(|| unavailable(stage, name))
    }

    pub fn encoder(&self, stage: &str, name: &str) -> Result<EncoderFactory, ConstructionError> {
        self.encoders.get(name).cloned().ok_or_else(|| unavailable(stage, name))
    }

    pub fn detector(&self, stage: &str, name: &str) -> Result<DetectorFactory, ConstructionError> {
        self.detectors.get(name).cloned().ok_or_else(|| unavailable(stage, name))
    }
}

fn unavailable(stage: &str, backend: &str) -> ConstructionError {
    let reason = if backend == "ffmpeg" && !cfg!(feature = "ffmpeg") {
        "built without the `ffmpeg` feature"
    } else {
        "no such backend"
    };
    ConstructionError::Unavailable {
        stage: stage.to_string(),
        backend: backend.to_string(),
        reason: reason.to_string(),
    }
}
