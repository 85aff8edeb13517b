//! Assembling and running the relay from its configuration

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::backend::Backends;
use crate::config::{AppConfig, PublishConfig};
use crate::error::{PipelineError, PublishError};
use crate::pipeline::bus::{Bus, BusReceiver};
use crate::pipeline::controller::LifecycleController;
use crate::pipeline::graph::StageGraph;
use crate::pipeline::health::PipelineHealth;
use crate::pipeline::probe::{self, AnnotationProbe, FrameCounter};
use crate::publish::{RelayFeed, StreamPublisher};
use crate::stages::builtin_registry;

/// A built, negotiated graph that has not been started
pub struct Assembly {
    pub graph: StageGraph,
    pub events: BusReceiver,
    pub bus: Bus,
    /// Frames seen by the annotation probe
    pub counter: FrameCounter,
}

/// Build the configured topology and attach the annotation probe
pub fn assemble(config: &AppConfig, backends: &Backends) -> Result<Assembly, PipelineError> {
    let (bus, events) = Bus::new();
    let health = Arc::new(PipelineHealth::new());
    let mut graph = StageGraph::new(builtin_registry(backends), bus.clone(), health)
        .with_channel_capacity(config.runtime.channel_capacity.max(1));

    graph.build(&config.topology())?;

    let counter = FrameCounter::new();
    let annotation = &config.annotation;
    match graph.handle(&annotation.attach_to) {
        Some(handle) => {
            let probe = AnnotationProbe::new(annotation.classes.clone(), annotation.style(), counter.clone());
            graph.add_probe(handle, probe::shared(probe))?;
            debug!("Pipeline: annotation probe attached to {}", annotation.attach_to);
        }
        None => warn!(
            "Pipeline: no stage named '{}', frames will not be annotated",
            annotation.attach_to
        ),
    }

    debug!("Pipeline caps:\n{}", graph.describe_caps());

    Ok(Assembly {
        graph,
        events,
        bus,
        counter,
    })
}

/// Start the RTSP server and mount the relay
///
/// A failure is returned only for a critical publisher; otherwise it is
/// logged and the pipeline runs without one.
pub async fn start_publisher(
    config: &PublishConfig,
    payload_type: u8,
) -> Result<Option<StreamPublisher>, PipelineError> {
    if !config.enabled {
        return Ok(None);
    }
    match try_publish(config, payload_type).await {
        Ok(publisher) => Ok(Some(publisher)),
        Err(e) if config.critical => Err(e.into()),
        Err(e) => {
            warn!("Publisher: disabled: {}", e);
            Ok(None)
        }
    }
}

async fn try_publish(config: &PublishConfig, payload_type: u8) -> Result<StreamPublisher, PublishError> {
    let relay: SocketAddr = config
        .relay
        .parse()
        .map_err(|_| PublishError::InvalidRelay(config.relay.clone()))?;
    let publisher = StreamPublisher::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))).await?;
    if let Err(e) = publisher
        .publish(&config.mount, RelayFeed::h264(relay, payload_type))
        .await
    {
        publisher.shutdown().await;
        return Err(e);
    }
    info!(
        "\n *** aerocast: Launched RTSP Streaming at {} ***\n",
        publisher.url(&config.mount)
    );
    Ok(publisher)
}

/// Everything needed to run once the process is set up
pub struct Launch {
    pub controller: LifecycleController,
    pub bus: Bus,
    pub counter: FrameCounter,
}

/// Assemble, publish and start the pipeline
///
/// On a startup failure everything already started is torn down again.
pub async fn launch(config: &AppConfig, backends: &Backends) -> Result<Launch, PipelineError> {
    let Assembly {
        graph,
        events,
        bus,
        counter,
    } = assemble(config, backends)?;

    let mut controller =
        LifecycleController::new(graph, events).with_health_interval(config.runtime.health_interval());
    if let Some(publisher) = start_publisher(&config.publish, config.output.payload_type).await? {
        controller = controller.with_publisher(publisher);
    }

    if let Err(e) = controller.start().await {
        controller.shutdown().await;
        return Err(e);
    }
    Ok(Launch {
        controller,
        bus,
        counter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::controller::ShutdownReason;
    use crate::h264::tests::access_unit;
    use crate::pipeline::bus::ControlEvent;
    use crate::pipeline::state::PipelineState;
    use crate::testing::{FakeDecoder, FakeDetector, FakeEncoder};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, UdpSocket};

    fn fake_backends() -> Backends {
        let mut backends = Backends::builtin();
        backends.register_decoder("fake", || Ok(Box::new(FakeDecoder::new(64, 36))));
        backends.register_encoder("fake", |_| Ok(Box::new(FakeEncoder::new())));
        backends.register_detector("fake", |_| Ok(Box::new(FakeDetector::per_frame(vec![(2, 1), (0, 2), (7, 1)]))));
        backends
    }

    async fn test_config(source: SocketAddr, out: SocketAddr, batch_size: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.source.host = source.ip().to_string();
        config.source.port = source.port();
        config.codec.decoder = "fake".to_string();
        config.codec.encoder = "fake".to_string();
        config.inference.detector = "fake".to_string();
        config.muxer.width = 64;
        config.muxer.height = 36;
        config.muxer.batch_size = batch_size;
        config.output.hosts = vec![out.to_string()];
        config.publish.enabled = false;
        config
    }

    /// A drone stand-in that streams `count` access units and hangs up
    async fn drone(count: usize, hang_up: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for i in 0..count {
                stream.write_all(&access_unit(i % 10 == 0, 40)).await.unwrap();
            }
            if hang_up {
                stream.shutdown().await.unwrap();
            } else {
                std::future::pending::<()>().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_end_to_end_relay() {
        let source = drone(100, true).await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(source, receiver.local_addr().unwrap(), 10).await;

        let launch = launch(&config, &fake_backends()).await.unwrap();
        assert_eq!(launch.controller.state(), PipelineState::Playing);
        let health = launch.controller.graph().health().clone();
        let counter = launch.counter.clone();

        let reason = launch.controller.run().await;
        assert_eq!(reason, ShutdownReason::EndOfStream);
        assert_eq!(reason.exit_code(), 0);

        assert_eq!(health.batches_formed(), 10);
        assert_eq!(counter.get(), 100);

        let mut buf = [0u8; 2048];
        let mut markers = 0;
        while let Ok(n) = receiver.try_recv(&mut buf) {
            assert!(n > 12);
            if buf[1] & 0x80 != 0 {
                markers += 1;
            }
        }
        // one marked packet per encoded frame
        assert_eq!(markers, 100);
    }

    #[tokio::test]
    async fn test_interrupt_stops_live_stream() {
        let source = drone(3, false).await;
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(source, receiver.local_addr().unwrap(), 1).await;

        let launch = launch(&config, &fake_backends()).await.unwrap();
        launch.bus.post(ControlEvent::Interrupted);
        let reason = launch.controller.run().await;
        assert_eq!(reason, ShutdownReason::Interrupted);
        assert_eq!(reason.exit_code(), 130);
    }

    #[tokio::test]
    async fn test_unreachable_drone_is_a_startup_failure() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let config = test_config(closed, "127.0.0.1:9".parse().unwrap(), 1).await;
        let err = launch(&config, &fake_backends()).await.err().unwrap();
        assert!(matches!(err, PipelineError::StateChange { ref stage, .. } if stage == "tcp-source"), "{}", err);
    }

    #[tokio::test]
    async fn test_default_config_assembles_with_builtin_codecs() {
        let config = AppConfig::default();
        assert!(assemble(&config, &Backends::builtin()).is_ok());
    }

    #[tokio::test]
    async fn test_missing_backend_fails_assembly() {
        let mut config = AppConfig::default();
        config.codec.decoder = "nvdec".to_string();
        let err = assemble(&config, &Backends::builtin()).err().unwrap();
        assert!(matches!(
            err,
            PipelineError::Construction(crate::error::ConstructionError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_non_critical_publisher_failure_is_ignored() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let mut config = PublishConfig::default();
        config.port = taken.local_addr().unwrap().port();

        config.critical = false;
        assert!(start_publisher(&config, 96).await.unwrap().is_none());

        config.critical = true;
        assert!(matches!(
            start_publisher(&config, 96).await,
            Err(PipelineError::Publish(PublishError::PortInUse { .. }))
        ));
    }
}
