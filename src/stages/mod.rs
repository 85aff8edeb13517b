//! Concrete stages and the factories that build them from configuration

pub mod convert;
pub mod decode;
pub mod encode;
pub mod filter;
pub mod infer;
pub mod muxer;
pub mod overlay;
pub mod parse;
pub mod rtp;
pub mod source;
pub mod udp;

use std::net::SocketAddr;
use std::time::Duration;

use crate::backend::Backends;
use crate::codec::DEFAULT_BACKEND;
use crate::error::ConstructionError;
use crate::pipeline::caps::{CapsSet, Fraction};
use crate::pipeline::registry::{StageConfig, StageRegistry};
use crate::pipeline::stage::{PipelineStage, TransformStage};

pub use convert::Converter;
pub use decode::DecodeStage;
pub use encode::EncodeStage;
pub use filter::CapsFilter;
pub use infer::InferStage;
pub use muxer::BatchMuxer;
pub use overlay::OverlayStage;
pub use parse::H264Parser;
pub use rtp::RtpPayloader;
pub use source::TcpSource;
pub use udp::UdpSink;

type Built = Result<Box<dyn PipelineStage>, ConstructionError>;

fn transform<T: crate::pipeline::stage::Transform + 'static>(config: &StageConfig, inner: T) -> Built {
    Ok(Box::new(TransformStage::new(&config.name, inner)))
}

fn port(config: &StageConfig, key: &str, default: u16) -> Result<u16, ConstructionError> {
    let value = config.u32_or(key, default as u32)?;
    u16::try_from(value).map_err(|_| ConstructionError::invalid(&config.name, key, format!("{} is not a port", value)))
}

fn random_ssrc() -> u32 {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    nanos.rotate_left(16) ^ std::process::id()
}

/// Registry with every built-in stage factory
///
/// Codec and detector stages resolve their engine in `backends` when built,
/// so a missing engine is reported before anything starts.
pub fn builtin_registry(backends: &Backends) -> StageRegistry {
    let mut registry = StageRegistry::new();

    registry.register("tcp_source", |config| {
        let host = config.str_or("host", "192.168.1.1")?;
        let port = port(config, "port", 5555)?;
        Ok(Box::new(TcpSource::new(&config.name, &host, port)))
    });

    registry.register("h264_parse", |config| {
        let framerate = config.parsed::<Fraction>("framerate")?.unwrap_or(Fraction::new(15, 1));
        if framerate.num == 0 {
            return Err(ConstructionError::invalid(&config.name, "framerate", "must be positive"));
        }
        transform(config, H264Parser::new(framerate))
    });

    registry.register("capsfilter", |config| {
        let caps = config
            .parsed::<CapsSet>("caps")?
            .ok_or_else(|| ConstructionError::invalid(&config.name, "caps", "missing"))?;
        transform(config, CapsFilter::new(caps))
    });

    let decoders = backends.clone();
    registry.register("h264_decode", move |config| {
        let backend = config.str_or("backend", DEFAULT_BACKEND)?;
        let factory = decoders.decoder(&config.name, &backend)?;
        transform(config, DecodeStage::new(factory))
    });

    registry.register("batch_mux", |config| {
        let width = config.u32_or("width", 640)?;
        let height = config.u32_or("height", 360)?;
        if width == 0 || height == 0 {
            return Err(ConstructionError::invalid(&config.name, "width", "output size must be positive"));
        }
        let batch_size = config.u32_or("batch_size", 1)?.max(1) as usize;
        let timeout = Duration::from_micros(config.u64_or("batch_timeout_us", 4_000_000)?);
        Ok(Box::new(BatchMuxer::new(&config.name, width, height, batch_size, timeout)))
    });

    let detectors = backends.clone();
    registry.register("infer", move |config| {
        let backend = config.str_or("detector", "none")?;
        let factory = detectors.detector(&config.name, &backend)?;
        transform(config, InferStage::new(factory, config.clone()))
    });

    registry.register("convert", |config| transform(config, Converter::new()));

    registry.register("overlay", |config| transform(config, OverlayStage::new()));

    let encoders = backends.clone();
    registry.register("h264_encode", move |config| {
        let backend = config.str_or("backend", DEFAULT_BACKEND)?;
        let bitrate = config.u32_or("bitrate", 4_000_000)?;
        let factory = encoders.encoder(&config.name, &backend)?;
        transform(config, EncodeStage::new(factory, bitrate))
    });

    registry.register("rtp_h264_pay", |config| {
        let mtu = config.u32_or("mtu", rtp::DEFAULT_MTU as u32)? as usize;
        let payload_type = config.u32_or("pt", rtp::DEFAULT_PAYLOAD_TYPE as u32)?;
        let payload_type = u8::try_from(payload_type)
            .map_err(|_| ConstructionError::invalid(&config.name, "pt", "out of range"))?;
        let ssrc = match config.properties.get("ssrc") {
            Some(_) => config.u32_or("ssrc", 0)?,
            None => random_ssrc(),
        };
        let payloader = RtpPayloader::new(mtu, payload_type, ssrc)
            .map_err(|e| ConstructionError::invalid(&config.name, "mtu", e))?;
        transform(config, payloader)
    });

    registry.register("udp_sink", |config| {
        let hosts = config
            .str_list("hosts")?
            .iter()
            .map(|h| h.parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConstructionError::invalid(&config.name, "hosts", e))?;
        let sink = UdpSink::new(&config.name, hosts).map_err(|e| ConstructionError::invalid(&config.name, "hosts", e))?;
        Ok(Box::new(sink))
    });

    registry
}
