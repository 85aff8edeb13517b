//! Lifecycle controller: drives the graph through its states and runs the
//! control event loop until the pipeline ends

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::publish::StreamPublisher;

use super::bus::{BusReceiver, ControlEvent};
use super::graph::StageGraph;
use super::state::{PipelineState, StateChange};

/// Why the event loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    EndOfStream,
    Error { stage: String, message: String },
    Interrupted,
}

impl ShutdownReason {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownReason::EndOfStream | ShutdownReason::Error { .. } => 0,
            ShutdownReason::Interrupted => 130,
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::EndOfStream => write!(f, "end of stream"),
            ShutdownReason::Error { stage, message } => write!(f, "error in {}: {}", stage, message),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Where the controller is in its own life, next to the graph's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built, not started yet
    Idle,
    Running,
    /// Teardown in progress; every further event is ignored
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running => "running",
            Lifecycle::ShuttingDown => "shutting down",
            Lifecycle::Stopped => "stopped",
        })
    }
}

/// Owns the graph and is the only place its state changes
pub struct LifecycleController {
    graph: StageGraph,
    events: BusReceiver,
    publisher: Option<StreamPublisher>,
    backlog: VecDeque<ControlEvent>,
    pending_sinks: HashSet<String>,
    health_interval: Duration,
    lifecycle: Lifecycle,
}

impl LifecycleController {
    pub fn new(graph: StageGraph, events: BusReceiver) -> Self {
        Self {
            graph,
            events,
            publisher: None,
            backlog: VecDeque::new(),
            pending_sinks: HashSet::new(),
            health_interval: Duration::from_secs(30),
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Publisher to tear down together with the pipeline
    pub fn with_publisher(mut self, publisher: StreamPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn state(&self) -> PipelineState {
        self.graph.state()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Step the graph from its current state up to Playing
    ///
    /// Every step is a barrier. For Paused -> Playing that means waiting
    /// until every stage task has acknowledged on the bus; events that
    /// arrive meanwhile are kept for the event loop.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        for change in self.graph.state().path_to(PipelineState::Playing) {
            info!("Pipeline: {}", change);
            self.graph.set_state(change).await?;
            if change == StateChange::PausedToPlaying {
                self.await_playing().await?;
            }
        }
        self.pending_sinks = self.graph.sinks().into_iter().collect();
        self.lifecycle = Lifecycle::Running;
        info!("Pipeline: running");
        Ok(())
    }

    async fn await_playing(&mut self) -> Result<(), PipelineError> {
        let mut pending: HashSet<String> = self.graph.stage_names().into_iter().collect();
        while !pending.is_empty() {
            match self.events.recv().await {
                Some(ControlEvent::StateChanged {
                    stage,
                    new: PipelineState::Playing,
                    ..
                }) => {
                    debug!("Pipeline: {} is playing", stage);
                    pending.remove(&stage);
                }
                Some(other) => self.backlog.push_back(other),
                None => {
                    return Err(PipelineError::Startup {
                        stage: "bus".to_string(),
                        reason: "control bus closed".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run the event loop until the pipeline ends, then tear it down
    pub async fn run(mut self) -> ShutdownReason {
        self.run_until_stopped().await
    }

    async fn run_until_stopped(&mut self) -> ShutdownReason {
        let mut ticker = tokio::time::interval(self.health_interval);
        ticker.tick().await;

        let reason = loop {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => tokio::select! {
                    event = self.events.recv() => match event {
                        Some(event) => event,
                        None => break ShutdownReason::Error {
                            stage: "bus".to_string(),
                            message: "control bus closed".to_string(),
                        },
                    },
                    _ = ticker.tick() => {
                        let health = self.graph.health();
                        info!("Pipeline [{}]: {}", self.lifecycle, health.summary());
                        if self.graph.state().is_running() && health.is_stalled(self.health_interval) {
                            warn!("Pipeline: no frames for {:?}, is the vehicle still streaming?", self.health_interval);
                        }
                        continue;
                    }
                },
            };

            if let Some(reason) = self.dispatch(event) {
                break reason;
            }
        };

        self.shutdown().await;
        reason
    }

    fn dispatch(&mut self, event: ControlEvent) -> Option<ShutdownReason> {
        match event {
            ControlEvent::Error { stage, message } => {
                error!("ERROR from element {}: {}", stage, message);
                Some(ShutdownReason::Error { stage, message })
            }
            ControlEvent::EndOfStream { stage } => {
                self.pending_sinks.remove(&stage);
                if self.pending_sinks.is_empty() {
                    info!("End of stream");
                    Some(ShutdownReason::EndOfStream)
                } else {
                    debug!(
                        "Pipeline: {} reached end of stream, waiting for {} more sink(s)",
                        stage,
                        self.pending_sinks.len()
                    );
                    None
                }
            }
            ControlEvent::StateChanged { stage, old, new } => {
                debug!("Pipeline: {} changed state {} -> {}", stage, old, new);
                None
            }
            ControlEvent::Interrupted => {
                info!("Interrupted, stopping pipeline");
                Some(ShutdownReason::Interrupted)
            }
        }
    }

    /// Drive the graph back to Null and stop the publisher
    ///
    /// Safe to call more than once; events still on the bus are discarded.
    pub async fn shutdown(&mut self) {
        if matches!(self.lifecycle, Lifecycle::ShuttingDown | Lifecycle::Stopped) {
            return;
        }
        self.lifecycle = Lifecycle::ShuttingDown;

        for change in self.graph.state().path_to(PipelineState::Null) {
            debug!("Pipeline: {}", change);
            if let Err(e) = self.graph.set_state(change).await {
                warn!("Pipeline: {} failed: {}", change, e);
                break;
            }
        }

        if let Some(publisher) = self.publisher.take() {
            publisher.shutdown().await;
        }

        let mut ignored = self.backlog.len();
        self.backlog.clear();
        while let Ok(event) = self.events.try_recv() {
            debug!("Pipeline: ignoring {:?} after shutdown", event);
            ignored += 1;
        }
        if ignored > 0 {
            debug!("Pipeline: discarded {} late events", ignored);
        }

        self.lifecycle = Lifecycle::Stopped;
        info!("Pipeline [{}]: {}", self.lifecycle, self.graph.health().summary());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::Bus;
    use crate::pipeline::caps::{Caps, CapsSet, MediaType};
    use crate::pipeline::health::PipelineHealth;
    use crate::pipeline::registry::StageRegistry;
    use crate::testing::{ChangeLog, ChannelSink, FailingStage, PassthroughStage, VecSource, raw_frame};
    use std::sync::Arc;

    fn caps() -> CapsSet {
        Caps::new(MediaType::RawVideo).into()
    }

    fn new_graph() -> (StageGraph, BusReceiver) {
        let (bus, rx) = Bus::new();
        (
            StageGraph::new(StageRegistry::new(), bus, Arc::new(PipelineHealth::new())),
            rx,
        )
    }

    #[tokio::test]
    async fn test_end_of_stream_stops_cleanly() {
        let (mut graph, rx) = new_graph();
        let frames = (0..5).map(raw_frame).collect();
        let src = graph.insert(Box::new(VecSource::new("src", caps(), frames))).unwrap();
        let mid = graph.insert(Box::new(PassthroughStage::new("mid", caps()))).unwrap();
        let (sink, mut out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, mid).unwrap();
        graph.link(mid, sink).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        controller.start().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Playing);

        let reason = controller.run().await;
        assert_eq!(reason, ShutdownReason::EndOfStream);
        assert_eq!(reason.exit_code(), 0);

        let mut received = 0;
        while out.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_stage_error_shuts_down() {
        let (mut graph, rx) = new_graph();
        let frames = (0..3).map(raw_frame).collect();
        let src = graph.insert(Box::new(VecSource::new("src", caps(), frames).hold_open())).unwrap();
        let bad = graph.insert(Box::new(FailingStage::new("decoder", caps(), 2))).unwrap();
        let (sink, _out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, bad).unwrap();
        graph.link(bad, sink).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        controller.start().await.unwrap();
        let reason = controller.run().await;

        match &reason {
            ShutdownReason::Error { stage, message } => {
                assert_eq!(stage, "decoder");
                assert!(message.contains("failed on buffer 2"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reason.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_stops_with_130() {
        let (mut graph, rx) = new_graph();
        let bus = graph.bus().clone();
        let src = graph
            .insert(Box::new(VecSource::new("src", caps(), vec![raw_frame(0)]).hold_open()))
            .unwrap();
        let (sink, mut out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, sink).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        controller.start().await.unwrap();
        let running = tokio::spawn(controller.run());

        // wait for data to flow before interrupting
        assert!(out.recv().await.is_some());
        bus.post(ControlEvent::Interrupted);

        let reason = running.await.unwrap();
        assert_eq!(reason, ShutdownReason::Interrupted);
        assert_eq!(reason.exit_code(), 130);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_every_sink() {
        let (mut graph, rx) = new_graph();
        let fast = graph
            .insert(Box::new(VecSource::new("fast", caps(), vec![raw_frame(0)])))
            .unwrap();
        let slow = graph
            .insert(Box::new(
                VecSource::new("slow", caps(), (0..3).map(raw_frame).collect())
                    .with_interval(Duration::from_secs(2)),
            ))
            .unwrap();
        let (sink_a, _out_a) = ChannelSink::new("sink_a", caps());
        let (sink_b, mut out_b) = ChannelSink::new("sink_b", caps());
        let sink_a = graph.insert(Box::new(sink_a)).unwrap();
        let sink_b = graph.insert(Box::new(sink_b)).unwrap();
        graph.link(fast, sink_a).unwrap();
        graph.link(slow, sink_b).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        controller.start().await.unwrap();
        assert_eq!(controller.run().await, ShutdownReason::EndOfStream);

        let mut received = 0;
        while out_b.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (mut graph, rx) = new_graph();
        let bus = graph.bus().clone();
        let src = graph.insert(Box::new(VecSource::new("src", caps(), vec![]).hold_open())).unwrap();
        let (sink, _out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, sink).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        controller.start().await.unwrap();
        bus.post(ControlEvent::Error {
            stage: "late".into(),
            message: "ignored".into(),
        });
        controller.shutdown().await;
        assert_eq!(controller.state(), PipelineState::Null);
        controller.shutdown().await;
        assert_eq!(controller.state(), PipelineState::Null);
    }

    #[tokio::test]
    async fn test_simultaneous_errors_stop_once() {
        let (mut graph, rx) = new_graph();
        let bus = graph.bus().clone();
        let log = ChangeLog::default();
        let src = graph.insert(Box::new(VecSource::new("src", caps(), vec![]).hold_open())).unwrap();
        let mid = graph
            .insert(Box::new(PassthroughStage::new("mid", caps()).with_log(log.clone())))
            .unwrap();
        let (sink, _out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, mid).unwrap();
        graph.link(mid, sink).unwrap();

        let publisher = StreamPublisher::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let rtsp = publisher.local_addr();

        let mut controller = LifecycleController::new(graph, rx).with_publisher(publisher);
        assert_eq!(controller.lifecycle(), Lifecycle::Idle);
        controller.start().await.unwrap();
        assert_eq!(controller.lifecycle(), Lifecycle::Running);

        for stage in ["decoder", "encoder"] {
            bus.post(ControlEvent::Error {
                stage: stage.into(),
                message: format!("{} broke", stage),
            });
        }
        bus.post(ControlEvent::EndOfStream { stage: "sink".into() });

        let reason = controller.run_until_stopped().await;
        assert_eq!(
            reason,
            ShutdownReason::Error {
                stage: "decoder".into(),
                message: "decoder broke".into(),
            }
        );
        assert_eq!(controller.state(), PipelineState::Null);
        assert_eq!(controller.lifecycle(), Lifecycle::Stopped);
        assert!(controller.publisher.is_none());
        // the RTSP listener is gone
        assert!(std::net::TcpListener::bind(rtsp).is_ok());

        let to_null = |log: &ChangeLog| {
            log.lock()
                .unwrap()
                .iter()
                .filter(|c| **c == StateChange::ReadyToNull)
                .count()
        };
        assert_eq!(to_null(&log), 1);
        let recorded = log.lock().unwrap().len();

        controller.shutdown().await;
        assert_eq!(controller.lifecycle(), Lifecycle::Stopped);
        assert_eq!(to_null(&log), 1);
        assert_eq!(log.lock().unwrap().len(), recorded);
    }

    #[tokio::test]
    async fn test_start_failure_reports_stage() {
        let (mut graph, rx) = new_graph();
        let src = graph
            .insert(Box::new(VecSource::new("src", caps(), vec![]).fail_on_pause()))
            .unwrap();
        let (sink, _out) = ChannelSink::new("sink", caps());
        let sink = graph.insert(Box::new(sink)).unwrap();
        graph.link(src, sink).unwrap();

        let mut controller = LifecycleController::new(graph, rx);
        let err = controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StateChange {
                change: StateChange::ReadyToPaused,
                ..
            }
        ));
        assert_eq!(controller.state(), PipelineState::Ready);
        controller.shutdown().await;
        assert_eq!(controller.state(), PipelineState::Null);
    }
}
