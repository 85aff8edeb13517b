//! Stage graph: construction, capability negotiation and task wiring

use std::fmt::Write as _;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ConstructionError, NegotiationError, PipelineError};

use super::bus::{Bus, ControlEvent};
use super::caps::{CapsSet, Format, negotiate};
use super::health::PipelineHealth;
use super::probe::SharedProbe;
use super::registry::{StageConfig, StageRegistry};
use super::stage::{PipelineStage, StageContext, StageInput, StageKind};
use super::state::{PipelineState, StateChange};
use super::types::Flow;

/// Index of a stage within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle(usize);

/// A negotiated edge between two stages
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub producer: StageHandle,
    pub consumer: StageHandle,
    pub format: Format,
    /// Input pad index on the consumer
    pub pad: usize,
}

/// Declarative link between two named stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    pub from: String,
    pub to: String,
    /// Fixed format to apply instead of negotiating
    #[serde(default)]
    pub caps: Option<String>,
}

impl LinkConfig {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            caps: None,
        }
    }

    pub fn with_caps(mut self, caps: &str) -> Self {
        self.caps = Some(caps.to_string());
        self
    }
}

/// A whole pipeline described as data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub stages: Vec<StageConfig>,
    pub links: Vec<LinkConfig>,
}

struct Node {
    name: String,
    kind: StageKind,
    stage: Option<Box<dyn PipelineStage>>,
    probes: Vec<SharedProbe>,
}

type Runner = JoinHandle<(usize, Box<dyn PipelineStage>)>;

/// Typed stages connected by negotiated links
///
/// Links can only be created while the graph is in `Null`; from `Playing`
/// on, every stage runs in its own task and buffers travel over bounded
/// channels between them.
pub struct StageGraph {
    nodes: Vec<Node>,
    links: Vec<Link>,
    state: PipelineState,
    registry: StageRegistry,
    bus: Bus,
    health: Arc<PipelineHealth>,
    channel_capacity: usize,
    cancel: CancellationToken,
    runners: Vec<Runner>,
}

impl StageGraph {
    pub fn new(registry: StageRegistry, bus: Bus, health: Arc<PipelineHealth>) -> Self {
        Self {
            nodes: Vec::new(),
            links: Vec::new(),
            state: PipelineState::Null,
            registry,
            bus,
            health,
            channel_capacity: 32,
            cancel: CancellationToken::new(),
            runners: Vec::new(),
        }
    }

    /// Capacity of every link channel, at least 1
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn handle(&self, name: &str) -> Option<StageHandle> {
        self.nodes.iter().position(|n| n.name == name).map(StageHandle)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Names of every sink stage
    pub fn sinks(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.kind == StageKind::Sink)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Build a stage through the registry and add it to the graph
    pub fn add_stage(
        &mut self,
        kind: StageKind,
        config: &StageConfig,
    ) -> Result<StageHandle, ConstructionError> {
        let mut config = config.clone();
        config.kind = kind;
        if self.handle(&config.name).is_some() {
            return Err(ConstructionError::DuplicateName(config.name));
        }
        let stage = self.registry.create(&config)?;
        self.insert(stage)
    }

    /// Add an already built stage
    pub fn insert(&mut self, stage: Box<dyn PipelineStage>) -> Result<StageHandle, ConstructionError> {
        let name = stage.name().to_string();
        if self.handle(&name).is_some() {
            return Err(ConstructionError::DuplicateName(name));
        }
        debug!("StageGraph: added {} stage '{}'", stage.kind(), name);
        self.nodes.push(Node {
            name,
            kind: stage.kind(),
            stage: Some(stage),
            probes: Vec::new(),
        });
        Ok(StageHandle(self.nodes.len() - 1))
    }

    /// Attach a probe to a stage's input side
    pub fn add_probe(&mut self, handle: StageHandle, probe: SharedProbe) -> Result<(), NegotiationError> {
        let node = self
            .nodes
            .get_mut(handle.0)
            .ok_or_else(|| NegotiationError::UnknownStage(format!("#{}", handle.0)))?;
        node.probes.push(probe);
        Ok(())
    }

    /// Link two stages, negotiating the format the link carries
    pub fn link(&mut self, producer: StageHandle, consumer: StageHandle) -> Result<Link, NegotiationError> {
        self.check_linkable(producer, consumer)?;
        let producer_caps = self.producer_caps(producer)?;
        let consumer_caps = self.stage(consumer)?.sink_caps();

        let Some(format) = negotiate(&producer_caps, &consumer_caps) else {
            return Err(NegotiationError::Incompatible {
                producer: self.nodes[producer.0].name.clone(),
                consumer: self.nodes[consumer.0].name.clone(),
                producer_caps: producer_caps.to_string(),
                consumer_caps: consumer_caps.to_string(),
            });
        };
        Ok(self.add_link(producer, consumer, format))
    }

    /// Link two stages with a fixed format instead of negotiating
    pub fn link_with_override(
        &mut self,
        producer: StageHandle,
        consumer: StageHandle,
        format: Format,
    ) -> Result<Link, NegotiationError> {
        self.check_linkable(producer, consumer)?;
        let producer_caps = self.producer_caps(producer)?;
        let consumer_caps = self.stage(consumer)?.sink_caps();

        if !producer_caps.accepts(&format) || !consumer_caps.accepts(&format) {
            return Err(NegotiationError::OverrideRejected {
                producer: self.nodes[producer.0].name.clone(),
                consumer: self.nodes[consumer.0].name.clone(),
                format: format.to_string(),
            });
        }
        Ok(self.add_link(producer, consumer, format))
    }

    /// Build a graph from a declarative topology
    pub fn build(&mut self, topology: &Topology) -> Result<(), PipelineError> {
        for config in &topology.stages {
            self.add_stage(config.kind, config)?;
        }
        for link in &topology.links {
            let producer = self
                .handle(&link.from)
                .ok_or_else(|| NegotiationError::UnknownStage(link.from.clone()))?;
            let consumer = self
                .handle(&link.to)
                .ok_or_else(|| NegotiationError::UnknownStage(link.to.clone()))?;
            match &link.caps {
                Some(caps) => {
                    let format: Format = caps.parse().map_err(|e| {
                        ConstructionError::invalid(&link.to, "caps", format!("{} ({})", caps, e))
                    })?;
                    self.link_with_override(producer, consumer, format)?;
                }
                None => {
                    self.link(producer, consumer)?;
                }
            }
        }
        Ok(())
    }

    fn stage(&self, handle: StageHandle) -> Result<&dyn PipelineStage, NegotiationError> {
        self.nodes
            .get(handle.0)
            .and_then(|n| n.stage.as_deref())
            .ok_or_else(|| NegotiationError::UnknownStage(format!("#{}", handle.0)))
    }

    fn input_link(&self, handle: StageHandle) -> Option<&Link> {
        self.links.iter().find(|l| l.consumer == handle)
    }

    fn output_link(&self, handle: StageHandle) -> Option<&Link> {
        self.links.iter().find(|l| l.producer == handle)
    }

    fn producer_caps(&self, producer: StageHandle) -> Result<CapsSet, NegotiationError> {
        let input = self.input_link(producer).map(|l| &l.format);
        Ok(self.stage(producer)?.src_caps(input))
    }

    fn check_linkable(&self, producer: StageHandle, consumer: StageHandle) -> Result<(), NegotiationError> {
        if self.state != PipelineState::Null {
            return Err(NegotiationError::PipelineActive(self.state));
        }
        self.stage(producer)?;
        self.stage(consumer)?;
        if self.output_link(producer).is_some() {
            return Err(NegotiationError::AlreadyLinked(self.nodes[producer.0].name.clone()));
        }
        let consumer_node = &self.nodes[consumer.0];
        if self.input_link(consumer).is_some() && !consumer_node.kind.accepts_many_inputs() {
            return Err(NegotiationError::InputTaken(consumer_node.name.clone()));
        }
        Ok(())
    }

    fn add_link(&mut self, producer: StageHandle, consumer: StageHandle, format: Format) -> Link {
        let pad = self.links.iter().filter(|l| l.consumer == consumer).count();
        let link = Link {
            producer,
            consumer,
            format,
            pad,
        };
        info!(
            "StageGraph: linked {} -> {} [{}]",
            self.nodes[producer.0].name, self.nodes[consumer.0].name, link.format
        );
        self.links.push(link.clone());
        link
    }

    /// Every stage's caps templates and every link's negotiated format
    pub fn describe_caps(&self) -> String {
        let mut out = String::new();
        for (index, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(out, "stage '{}' ({})", node.name, node.kind);
            if let Some(stage) = &node.stage {
                let input = self.input_link(StageHandle(index)).map(|l| &l.format);
                let _ = writeln!(out, "  sink: {}", stage.sink_caps());
                let _ = writeln!(out, "  src:  {}", stage.src_caps(input));
            }
        }
        for link in &self.links {
            let _ = writeln!(
                out,
                "link '{}' -> '{}' pad {}: {}",
                self.nodes[link.producer.0].name, self.nodes[link.consumer.0].name, link.pad, link.format
            );
        }
        out
    }

    /// Check that every stage is wired as its kind requires
    pub fn validate(&self) -> Result<(), ConstructionError> {
        for (index, node) in self.nodes.iter().enumerate() {
            let handle = StageHandle(index);
            if node.kind.has_input() && self.input_link(handle).is_none() {
                return Err(ConstructionError::Unlinked {
                    stage: node.name.clone(),
                    direction: "input",
                });
            }
            if node.kind.has_output() && self.output_link(handle).is_none() {
                return Err(ConstructionError::Unlinked {
                    stage: node.name.clone(),
                    direction: "output",
                });
            }
        }
        Ok(())
    }

    /// Apply one state change to every stage
    ///
    /// Returns once every stage has completed the change, except for
    /// Paused -> Playing where stage tasks acknowledge on the bus.
    pub async fn set_state(&mut self, change: StateChange) -> Result<(), PipelineError> {
        if change.from_state() != self.state {
            return Err(PipelineError::InvalidTransition {
                from: self.state,
                to: change.to_state(),
            });
        }

        match change {
            StateChange::NullToReady => {
                self.validate()?;
                self.configure_stages()?;
                self.change_stages(change).await?;
            }
            StateChange::PausedToPlaying => self.spawn_stages()?,
            StateChange::PlayingToPaused => {
                self.stop_stages().await;
                self.change_stages(change).await?;
            }
            _ => self.change_stages(change).await?,
        }

        self.state = change.to_state();
        debug!("StageGraph: now {}", self.state);
        Ok(())
    }

    fn configure_stages(&mut self) -> Result<(), PipelineError> {
        for index in 0..self.nodes.len() {
            let handle = StageHandle(index);
            let input = self.input_link(handle).map(|l| l.format.clone());
            let output = self.output_link(handle).map(|l| l.format.clone());
            let node = &mut self.nodes[index];
            if let Some(stage) = node.stage.as_mut() {
                stage
                    .configure(input.as_ref(), output.as_ref())
                    .map_err(|e| PipelineError::Startup {
                        stage: node.name.clone(),
                        reason: format!("{:#}", e),
                    })?;
            }
        }
        Ok(())
    }

    /// Sinks first, so consumers are ready before their producers
    ///
    /// Failures abort an upward change; going down, every stage is still
    /// given the chance to release its resources.
    async fn change_stages(&mut self, change: StateChange) -> Result<(), PipelineError> {
        for node in self.nodes.iter_mut().rev() {
            let Some(stage) = node.stage.as_mut() else {
                continue;
            };
            if let Err(e) = stage.change_state(change).await {
                if change.is_upward() {
                    return Err(PipelineError::StateChange {
                        stage: node.name.clone(),
                        change,
                        reason: format!("{:#}", e),
                    });
                }
                warn!("{}: {} failed: {:#}", node.name, change, e);
            }
        }
        Ok(())
    }

    fn spawn_stages(&mut self) -> Result<(), PipelineError> {
        self.cancel = CancellationToken::new();

        let mut inputs: Vec<Vec<StageInput>> = self.nodes.iter().map(|_| Vec::new()).collect();
        let mut outputs: Vec<Option<(mpsc::Sender<Flow>, Format)>> =
            self.nodes.iter().map(|_| None).collect();
        for link in &self.links {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            outputs[link.producer.0] = Some((tx, link.format.clone()));
            let probes = self.nodes[link.consumer.0].probes.clone();
            inputs[link.consumer.0].push(StageInput::new(link.pad, link.format.clone(), rx, probes));
        }

        for (index, (node_inputs, output)) in inputs.into_iter().zip(outputs).enumerate() {
            let node = &mut self.nodes[index];
            let mut stage = node.stage.take().ok_or_else(|| PipelineError::Startup {
                stage: node.name.clone(),
                reason: "stage was lost by an earlier run".to_string(),
            })?;
            let mut node_inputs = node_inputs;
            node_inputs.sort_by_key(StageInput::pad);

            let mut ctx = StageContext::new(
                &node.name,
                node_inputs,
                output,
                self.bus.clone(),
                self.health.clone(),
            );
            let name = node.name.clone();
            let kind = node.kind;
            let bus = self.bus.clone();
            let health = self.health.clone();
            let cancel = self.cancel.clone();

            self.runners.push(tokio::spawn(async move {
                bus.post(ControlEvent::StateChanged {
                    stage: name.clone(),
                    old: PipelineState::Paused,
                    new: PipelineState::Playing,
                });

                let result = tokio::select! {
                    result = stage.run(&mut ctx) => Some(result),
                    _ = cancel.cancelled() => None,
                };

                match result {
                    Some(Ok(())) if kind == StageKind::Sink => {
                        if ctx.eos_received() {
                            bus.post_eos(&name);
                        } else if !cancel.is_cancelled() {
                            debug!("{}: input closed before end-of-stream", name);
                        }
                    }
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!("{}: {:#}", name, e);
                        health.record_stage_error();
                        bus.post_error(&name, &e);
                    }
                    None => debug!("{}: cancelled", name),
                }

                // downstream must observe the error before its input closes
                drop(ctx);
                (index, stage)
            }));
        }
        Ok(())
    }

    /// Cancel every stage task and take the stages back
    async fn stop_stages(&mut self) {
        self.cancel.cancel();
        for runner in self.runners.drain(..) {
            match runner.await {
                Ok((index, stage)) => self.nodes[index].stage = Some(stage),
                Err(e) => error!("StageGraph: stage task failed to join: {}", e),
            }
        }
    }
}
