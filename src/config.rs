//! Application configuration
//!
//! Every field has a default, so an empty (or missing) config file yields
//! the stock drone relay: TCP ingest from the vehicle at 192.168.1.1:5555,
//! 640x360 batches of one frame, and an RTSP mount at `/ds-test` on 8554.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_BACKEND;
use crate::pipeline::graph::{LinkConfig, Topology};
use crate::pipeline::probe::{LabelStyle, TrackedClass};
use crate::pipeline::registry::StageConfig;
use crate::pipeline::stage::StageKind;
use crate::pipeline::types::{Color, FontParams};

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    /// Frame rate of the incoming elementary stream
    pub framerate: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.1".to_string(),
            port: 5555,
            framerate: "15/1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub batch_timeout_us: u64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            batch_size: 1,
            batch_timeout_us: 4_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub decoder: String,
    pub encoder: String,
    pub bitrate: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            decoder: DEFAULT_BACKEND.to_string(),
            encoder: DEFAULT_BACKEND.to_string(),
            bitrate: 4_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub detector: String,
    /// Passed through to the detector backend
    pub config_file: Option<String>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            detector: "none".to_string(),
            config_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Stage whose input the annotation probe watches
    pub attach_to: String,
    pub classes: Vec<TrackedClass>,
    pub x_offset: u32,
    pub y_offset: u32,
    pub font: String,
    pub font_size: u32,
    pub box_border_width: u32,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            attach_to: "osd".to_string(),
            classes: TrackedClass::defaults(),
            x_offset: 10,
            y_offset: 12,
            font: "Courier".to_string(),
            font_size: 24,
            box_border_width: 2,
        }
    }
}

impl AnnotationConfig {
    pub fn style(&self) -> LabelStyle {
        LabelStyle {
            x_offset: self.x_offset,
            y_offset: self.y_offset,
            font: FontParams {
                name: self.font.clone(),
                size: self.font_size,
                color: Color::WHITE,
            },
            background: Some(Color::BLACK),
            box_border_width: self.box_border_width,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub mtu: u32,
    pub payload_type: u8,
    /// Every UDP destination of the RTP stream; the publisher relay is one of them
    pub hosts: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mtu: 1400,
            payload_type: 96,
            hosts: vec!["127.0.0.1:5400".to_string(), "224.224.255.255:5400".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub enabled: bool,
    pub port: u16,
    pub mount: String,
    /// Where the publisher picks up the RTP stream
    pub relay: String,
    /// Fail startup when the publisher cannot be set up
    pub critical: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8554,
            mount: "/ds-test".to_string(),
            relay: "127.0.0.1:5400".to_string(),
            critical: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Buffers in flight per link
    pub channel_capacity: usize,
    pub health_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8,
            health_interval_secs: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub muxer: MuxerConfig,
    pub codec: CodecConfig,
    pub inference: InferenceConfig,
    pub annotation: AnnotationConfig,
    pub output: OutputConfig,
    pub publish: PublishConfig,
    pub runtime: RuntimeConfig,
    /// Replaces the built-in stage layout when present
    pub topology: Option<Topology>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// The stage layout to build: the configured one, or the built-in
    /// ingest -> detect -> overlay -> encode -> RTP chain
    pub fn topology(&self) -> Topology {
        match &self.topology {
            Some(topology) => topology.clone(),
            None => self.default_topology(),
        }
    }

    fn default_topology(&self) -> Topology {
        let muxer = &self.muxer;
        let mut infer = StageConfig::new("primary-inference", StageKind::Annotator, "infer")
            .with("detector", self.inference.detector.as_str());
        if let Some(file) = &self.inference.config_file {
            infer = infer.with("config_file", file.as_str());
        }
        let hosts: Vec<toml::Value> = self.output.hosts.iter().map(|h| h.as_str().into()).collect();

        let stages = vec![
            StageConfig::new("tcp-source", StageKind::Source, "tcp_source")
                .with("host", self.source.host.as_str())
                .with("port", self.source.port as i64),
            StageConfig::new("h264-parser", StageKind::Filter, "h264_parse")
                .with("framerate", self.source.framerate.as_str()),
            StageConfig::new("decoder", StageKind::Filter, "h264_decode")
                .with("backend", self.codec.decoder.as_str()),
            StageConfig::new("filter-src", StageKind::Filter, "capsfilter").with(
                "caps",
                format!(
                    "video/x-raw, format=NV12, width={}, height={}, framerate={}",
                    muxer.width, muxer.height, self.source.framerate
                ),
            ),
            StageConfig::new("stream-muxer", StageKind::Muxer, "batch_mux")
                .with("width", muxer.width as i64)
                .with("height", muxer.height as i64)
                .with("batch_size", muxer.batch_size as i64)
                .with("batch_timeout_us", muxer.batch_timeout_us as i64),
            infer,
            StageConfig::new("converter", StageKind::Transform, "convert"),
            StageConfig::new("osd", StageKind::Overlay, "overlay"),
            StageConfig::new("transform", StageKind::Transform, "convert"),
            StageConfig::new("filter", StageKind::Filter, "capsfilter").with("caps", "video/x-raw, format=I420"),
            StageConfig::new("encoder", StageKind::Encoder, "h264_encode")
                .with("backend", self.codec.encoder.as_str())
                .with("bitrate", self.codec.bitrate as i64),
            StageConfig::new("rtppay", StageKind::Packetizer, "rtp_h264_pay")
                .with("mtu", self.output.mtu as i64)
                .with("pt", self.output.payload_type as i64),
            StageConfig::new("sink", StageKind::Sink, "udp_sink").with("hosts", hosts),
        ];

        let links = stages
            .windows(2)
            .map(|pair| LinkConfig::new(&pair[0].name, &pair[1].name))
            .collect();

        Topology { stages, links }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.source.host, "192.168.1.1");
        assert_eq!(config.source.port, 5555);
        assert_eq!(config.publish.port, 8554);
        assert_eq!(config.publish.mount, "/ds-test");
        assert_eq!(config.muxer.batch_timeout_us, 4_000_000);
        assert_eq!(
            config.annotation.classes.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![2, 0]
        );
    }

    #[test]
    fn test_partial_override() {
        let config = AppConfig::from_toml(
            r#"
            [source]
            host = "10.0.0.7"

            [muxer]
            batch_size = 4

            [[annotation.classes]]
            id = 1
            label = "Bicycle"
            "#,
        )
        .unwrap();
        assert_eq!(config.source.host, "10.0.0.7");
        assert_eq!(config.source.port, 5555);
        assert_eq!(config.muxer.batch_size, 4);
        assert_eq!(config.muxer.width, 640);
        assert_eq!(config.annotation.classes.len(), 1);
        assert_eq!(config.annotation.classes[0].color, [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_default_topology_is_a_chain() {
        let topology = AppConfig::default().topology();
        assert_eq!(topology.stages.len(), 13);
        assert_eq!(topology.links.len(), 12);
        assert_eq!(topology.stages[0].kind, StageKind::Source);
        assert_eq!(topology.stages[12].kind, StageKind::Sink);
        assert_eq!(topology.links[0].from, "tcp-source");
        assert_eq!(topology.links[11].to, "sink");
        assert!(topology.stages.iter().any(|s| s.name == AppConfig::default().annotation.attach_to));
    }

    #[test]
    fn test_explicit_topology_wins() {
        let config = AppConfig::from_toml(
            r#"
            [[topology.stages]]
            name = "src"
            kind = "source"
            factory = "tcp_source"

            [[topology.stages]]
            name = "sink"
            kind = "sink"
            factory = "udp_sink"
            properties = { hosts = ["127.0.0.1:6000"] }

            [[topology.links]]
            from = "src"
            to = "sink"
            "#,
        )
        .unwrap();
        let topology = config.topology();
        assert_eq!(topology.stages.len(), 2);
        assert_eq!(topology.links, vec![LinkConfig::new("src", "sink")]);
    }
}
