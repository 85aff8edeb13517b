use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{info, warn};
use tokio::net::UdpSocket;

use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType};
use crate::pipeline::stage::{PipelineStage, StageContext, StageKind};
use crate::pipeline::state::StateChange;
use crate::pipeline::types::{Buffer, Flow};

/// Sends every packet to a fixed list of UDP destinations
///
/// Delivery is best effort: a failed send is counted and logged, never fatal.
pub struct UdpSink {
    name: String,
    hosts: Vec<SocketAddr>,
    socket: Option<UdpSocket>,
}

impl UdpSink {
    pub fn new(name: &str, hosts: Vec<SocketAddr>) -> Result<Self> {
        if hosts.is_empty() {
            bail!("no destination hosts");
        }
        Ok(Self {
            name: name.to_string(),
            hosts,
            socket: None,
        })
    }

    pub fn hosts(&self) -> &[SocketAddr] {
        &self.hosts
    }
}

#[async_trait]
impl PipelineStage for UdpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn sink_caps(&self) -> CapsSet {
        Caps::new(MediaType::Rtp).into()
    }

    fn src_caps(&self, _input: Option<&Format>) -> CapsSet {
        CapsSet::Structures(Vec::new())
    }

    async fn change_state(&mut self, change: StateChange) -> Result<()> {
        match change {
            StateChange::ReadyToPaused => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .context("failed to bind UDP socket")?;
                if self.hosts.iter().any(|h| h.ip().is_multicast()) {
                    socket.set_multicast_loop_v4(true)?;
                }
                self.socket = Some(socket);
            }
            StateChange::PausedToReady => self.socket = None,
            _ => {}
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No output socket"))?;

        info!("{}: started, sending to {:?}", self.name, self.hosts);
        let mut sent = 0u64;
        let mut failed = 0u64;

        while let Some(flow) = ctx.recv().await {
            let data = match flow {
                Flow::Buffer(Buffer::Packet(packet)) => packet.data,
                Flow::Buffer(Buffer::Frame(frame)) => frame.data,
                Flow::Buffer(Buffer::Batch(_)) => bail!("cannot send a batch over UDP"),
                Flow::Eos => break,
            };
            let mut delivered = false;
            for host in &self.hosts {
                match socket.send_to(&data, host).await {
                    Ok(_) => {
                        sent += 1;
                        delivered = true;
                    }
                    Err(e) => {
                        failed += 1;
                        ctx.health().record_network_error();
                        if failed.is_power_of_two() {
                            warn!("{}: send to {} failed ({} so far): {}", self.name, host, failed, e);
                        }
                    }
                }
            }
            if !delivered {
                ctx.health().record_frame_drop();
            }
        }

        info!(
            "{}: finished after {} datagrams ({} failed)",
            self.name, sent, failed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bus::Bus;
    use crate::pipeline::stage::StageInput;
    use crate::pipeline::types::{Packet, Timestamp};
    use bytes::Bytes;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_sends_to_every_host() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hosts = vec![a.local_addr().unwrap(), b.local_addr().unwrap()];

        let mut sink = UdpSink::new("udp", hosts).unwrap();
        sink.change_state(StateChange::ReadyToPaused).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let format = Caps::new(MediaType::Rtp).fixate();
        let (bus, _events) = Bus::new();
        let mut ctx = StageContext::new(
            "udp",
            vec![StageInput::new(0, format, rx, Vec::new())],
            None,
            bus,
            Default::default(),
        );
        let packet = Packet {
            data: Bytes::from_static(b"rtp!"),
            pts: Timestamp::default(),
            sequence_number: 0,
            marker: true,
        };
        tx.send(Flow::Buffer(Buffer::Packet(packet))).await.unwrap();
        tx.send(Flow::Eos).await.unwrap();

        sink.run(&mut ctx).await.unwrap();
        assert!(ctx.eos_received());

        let mut buf = [0u8; 16];
        for socket in [&a, &b] {
            let n = socket.recv(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"rtp!");
        }
    }

    #[test]
    fn test_requires_a_host() {
        assert!(UdpSink::new("udp", Vec::new()).is_err());
    }
}
