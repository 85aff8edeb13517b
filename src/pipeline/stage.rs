//! Pipeline stage trait and the context a stage task runs with
//!
//! Every stage runs in its own task; the graph hands it a `StageContext`
//! holding the receiving ends of its input links, the sending end of its
//! output link, the negotiated formats, and the control bus.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::bus::Bus;
use super::caps::{CapsSet, Format};
use super::health::PipelineHealth;
use super::probe::{self, SharedProbe};
use super::state::StateChange;
use super::types::{Buffer, Flow};

/// Role of a stage in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Filter,
    Muxer,
    Annotator,
    Overlay,
    Transform,
    Encoder,
    Packetizer,
    Sink,
}

impl StageKind {
    /// Sources have no upstream link
    pub fn has_input(&self) -> bool {
        !matches!(self, StageKind::Source)
    }

    /// Sinks have no downstream link
    pub fn has_output(&self) -> bool {
        !matches!(self, StageKind::Sink)
    }

    /// Only muxers merge several upstream links
    pub fn accepts_many_inputs(&self) -> bool {
        matches!(self, StageKind::Muxer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Source => "source",
            StageKind::Filter => "filter",
            StageKind::Muxer => "muxer",
            StageKind::Annotator => "annotator",
            StageKind::Overlay => "overlay",
            StageKind::Transform => "transform",
            StageKind::Encoder => "encoder",
            StageKind::Packetizer => "packetizer",
            StageKind::Sink => "sink",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for pipeline stages that process media data
#[async_trait]
pub trait PipelineStage: Send {
    /// Get the name of this stage for logging
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Formats accepted on the input side (empty for sources)
    fn sink_caps(&self) -> CapsSet;

    /// Formats the stage can produce, given its negotiated input if any
    fn src_caps(&self, input: Option<&Format>) -> CapsSet;

    /// Receive the negotiated formats, before the pipeline leaves Null
    fn configure(&mut self, _input: Option<&Format>, _output: Option<&Format>) -> Result<()> {
        Ok(())
    }

    /// Prepare for or release resources around a state change
    ///
    /// Called on the controller's task for every step except
    /// Paused -> Playing, which is acknowledged by the stage task itself.
    async fn change_state(&mut self, _change: StateChange) -> Result<()> {
        Ok(())
    }

    /// Run the stage, processing data until end-of-stream or cancellation
    async fn run(&mut self, ctx: &mut StageContext) -> Result<()>;
}

/// Receiving end of one input link
pub struct StageInput {
    pad: usize,
    format: Format,
    rx: mpsc::Receiver<Flow>,
    probes: Vec<SharedProbe>,
}

impl StageInput {
    pub(crate) fn new(pad: usize, format: Format, rx: mpsc::Receiver<Flow>, probes: Vec<SharedProbe>) -> Self {
        Self {
            pad,
            format,
            rx,
            probes,
        }
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    /// Next item, with this input's probes already applied
    ///
    /// `None` means the upstream task is gone without sending end-of-stream.
    pub async fn recv(&mut self) -> Option<Flow> {
        let mut flow = self.rx.recv().await?;
        if let Flow::Buffer(buffer) = &mut flow {
            probe::apply(&self.probes, buffer);
        }
        Some(flow)
    }
}

/// Everything a running stage needs from the graph
pub struct StageContext {
    name: String,
    inputs: Vec<StageInput>,
    output: Option<mpsc::Sender<Flow>>,
    output_format: Option<Format>,
    bus: Bus,
    health: Arc<PipelineHealth>,
    eos_received: bool,
}

impl StageContext {
    pub(crate) fn new(
        name: &str,
        inputs: Vec<StageInput>,
        output: Option<(mpsc::Sender<Flow>, Format)>,
        bus: Bus,
        health: Arc<PipelineHealth>,
    ) -> Self {
        let (output, output_format) = match output {
            Some((tx, format)) => (Some(tx), Some(format)),
            None => (None, None),
        };
        Self {
            name: name.to_string(),
            inputs,
            output,
            output_format,
            bus,
            health,
            eos_received: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether end-of-stream came through `recv`
    pub fn eos_received(&self) -> bool {
        self.eos_received
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Negotiated format of the first input link
    pub fn input_format(&self) -> Option<&Format> {
        self.inputs.first().map(StageInput::format)
    }

    /// Negotiated format of the output link
    pub fn output_format(&self) -> Option<&Format> {
        self.output_format.as_ref()
    }

    /// Take every input, for stages merging several links
    pub fn take_inputs(&mut self) -> Vec<StageInput> {
        std::mem::take(&mut self.inputs)
    }

    /// Receive from the first input
    pub async fn recv(&mut self) -> Option<Flow> {
        let flow = self.inputs.first_mut()?.recv().await;
        if matches!(flow, Some(Flow::Eos)) {
            self.eos_received = true;
        }
        flow
    }

    /// Push a buffer downstream
    ///
    /// Returns `false` once the downstream stage is gone.
    pub async fn push(&self, buffer: Buffer) -> bool {
        let Some(tx) = &self.output else {
            return false;
        };
        match &buffer {
            Buffer::Frame(frame) => self.health.record_frame(frame.size(), frame.is_keyframe),
            other => self.health.record_bytes(other.size()),
        }
        if tx.send(Flow::Buffer(buffer)).await.is_err() {
            info!("{}: output channel closed", self.name);
            return false;
        }
        true
    }

    /// Forward end-of-stream downstream
    pub async fn push_eos(&self) {
        if let Some(tx) = &self.output {
            if tx.send(Flow::Eos).await.is_err() {
                debug!("{}: output closed before end-of-stream", self.name);
            }
        }
    }
}

/// A single-input, single-output buffer transformation
///
/// Most stages only map buffers; `TransformStage` supplies the task loop.
pub trait Transform: Send {
    fn kind(&self) -> StageKind;

    fn sink_caps(&self) -> CapsSet;

    fn src_caps(&self, input: Option<&Format>) -> CapsSet;

    /// Called with the negotiated formats before the pipeline leaves Null
    fn configure(&mut self, _input: &Format, _output: &Format) -> Result<()> {
        Ok(())
    }

    /// Transform one buffer, appending results to `out`
    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()>;

    /// Drain anything held back at end-of-stream
    fn flush(&mut self, _out: &mut Vec<Buffer>) -> Result<()> {
        Ok(())
    }

    fn change_state(&mut self, _change: StateChange) -> Result<()> {
        Ok(())
    }
}

/// Adapter turning a `Transform` into a `PipelineStage`
pub struct TransformStage<T> {
    name: String,
    inner: T,
}

impl<T: Transform> TransformStage<T> {
    pub fn new(name: &str, inner: T) -> Self {
        Self {
            name: name.to_string(),
            inner,
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transform> PipelineStage for TransformStage<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.inner.kind()
    }

    fn sink_caps(&self) -> CapsSet {
        self.inner.sink_caps()
    }

    fn src_caps(&self, input: Option<&Format>) -> CapsSet {
        self.inner.src_caps(input)
    }

    fn configure(&mut self, input: Option<&Format>, output: Option<&Format>) -> Result<()> {
        let input = input.ok_or_else(|| anyhow::anyhow!("No input channel"))?;
        let output = output.ok_or_else(|| anyhow::anyhow!("No output channel"))?;
        self.inner.configure(input, output)
    }

    async fn change_state(&mut self, change: StateChange) -> Result<()> {
        self.inner.change_state(change)
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        info!("{}: started", self.name);
        let mut total_buffers = 0u64;
        let mut out = Vec::new();

        while let Some(flow) = ctx.recv().await {
            match flow {
                Flow::Buffer(buffer) => {
                    total_buffers += 1;
                    self.inner.transform(buffer, &mut out)?;
                    for buffer in out.drain(..) {
                        if !ctx.push(buffer).await {
                            return Ok(());
                        }
                    }
                }
                Flow::Eos => {
                    self.inner.flush(&mut out)?;
                    for buffer in out.drain(..) {
                        if !ctx.push(buffer).await {
                            return Ok(());
                        }
                    }
                    ctx.push_eos().await;
                    break;
                }
            }
        }

        info!("{}: finished after {} buffers", self.name, total_buffers);
        Ok(())
    }
}
