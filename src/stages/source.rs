use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use log::info;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType};
use crate::pipeline::stage::{PipelineStage, StageContext, StageKind};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{Buffer, Frame, Timestamp};

const READ_CHUNK: usize = 64 * 1024;

/// Reads a raw byte stream from a TCP server
///
/// The connection is opened when the pipeline goes to Paused, so an
/// unreachable peer is a startup failure rather than a runtime one. A run
/// consumes the connection; playing again reconnects.
pub struct TcpSource {
    name: String,
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpSource {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            addr: format!("{}:{}", host, port),
            stream: None,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        stream.set_nodelay(true)?;
        info!("{}: connected to {}", self.name, self.addr);
        Ok(stream)
    }
}

#[async_trait]
impl PipelineStage for TcpSource {
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
        Caps::new(MediaType::ByteStream).into()
    }

    async fn change_state(&mut self, change: StateChange) -> Result<()> {
        match change {
            StateChange::ReadyToPaused => {
                self.stream = Some(self.connect().await?);
            }
            StateChange::PausedToReady => {
                self.stream = None;
            }
            _ => {}
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let format = ctx
            .output_format()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No output channel"))?;

        info!("{}: started", self.name);
        let started = tokio::time::Instant::now();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunks = 0u64;
        let mut total_bytes = 0u64;

        loop {
            buf.reserve(READ_CHUNK);
            let n = stream
                .read_buf(&mut buf)
                .await
                .with_context(|| format!("read from {} failed", self.addr))?;
            if n == 0 {
                info!("{}: peer closed the connection", self.name);
                break;
            }
            total_bytes += n as u64;
            let pts = Timestamp::from_duration(started.elapsed());
            let frame = Frame::new(format.clone(), buf.split().freeze(), pts, chunks);
            chunks += 1;
            if !ctx.push(Buffer::Frame(frame)).await {
                return Ok(());
            }
        }

        ctx.push_eos().await;
        info!(
            "{}: finished after {} chunks ({} bytes)",
            self.name, chunks, total_bytes
        );
        Ok(())
    }
}
