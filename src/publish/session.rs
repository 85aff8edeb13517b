//! One RTSP client connection

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::rtsp::{self, Incoming, PUBLIC_METHODS, Request, Response, SessionDescription, Transport};
use super::{Mount, Shared};

const SESSION_TIMEOUT_SECS: u32 = 60;

/// Serve requests on one connection until the client leaves or the
/// publisher shuts down
pub(super) async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();

    // Requests are parsed on their own task so that a half-read request is
    // never lost when the loop below wakes up for a packet instead.
    let (tx, mut requests) = mpsc::channel::<Result<Request>>(8);
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            match rtsp::read_incoming(&mut reader).await {
                Ok(Some(Incoming::Request(request))) => {
                    if tx.send(Ok(request)).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Incoming::Interleaved { .. })) => {}
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let cancel = shared.cancel.clone();
    let mut session = Session::new(peer, shared);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            request = requests.recv() => match request {
                None => break Ok(()),
                Some(Err(e)) => {
                    let _ = writer.write_all(&Response::new(400, None).to_bytes()).await;
                    break Err(e);
                }
                Some(Ok(request)) => {
                    debug!("Publisher: {} {} from {}", request.method, request.uri, peer);
                    let response = session.handle(&request).await;
                    if let Err(e) = writer.write_all(&response.to_bytes()).await {
                        break Err(e.into());
                    }
                }
            },
            frame = session.next_interleaved() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        break Err(e.into());
                    }
                }
                None => {
                    info!("Publisher: mount ended, closing connection from {}", peer);
                    break Ok(());
                }
            }
        }
    };

    reader.abort();
    session.stop();
    debug!("Publisher: connection from {} closed", peer);
    result
}

struct Interleaved {
    channel: u8,
    packets: broadcast::Receiver<Bytes>,
    /// Cancelled when the mount is unpublished
    ended: CancellationToken,
}

struct Session {
    id: String,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mount: Option<Arc<Mount>>,
    transport: Option<Transport>,
    udp: Option<UdpSocket>,
    interleaved: Option<Interleaved>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    fn new(peer: SocketAddr, shared: Arc<Shared>) -> Self {
        Self {
            id: format!("{:016X}", shared.next_session_id()),
            peer,
            shared,
            mount: None,
            transport: None,
            udp: None,
            interleaved: None,
            forwarder: None,
        }
    }

    fn session_header(&self) -> String {
        format!("{};timeout={}", self.id, SESSION_TIMEOUT_SECS)
    }

    fn owns(&self, request: &Request) -> bool {
        request.session() == Some(self.id.as_str())
    }

    async fn handle(&mut self, request: &Request) -> Response {
        let Some(cseq) = request.cseq() else {
            return Response::new(400, None);
        };
        let cseq = Some(cseq);

        match request.method.as_str() {
            "OPTIONS" => Response::ok(cseq).with_header("Public", PUBLIC_METHODS),
            "DESCRIBE" => self.describe(request, cseq).await,
            "SETUP" => self.setup(request, cseq).await,
            "PLAY" => self.play(request, cseq),
            "TEARDOWN" => {
                if !self.owns(request) {
                    return Response::new(454, cseq);
                }
                self.stop();
                self.transport = None;
                self.mount = None;
                Response::ok(cseq)
            }
            "GET_PARAMETER" | "SET_PARAMETER" => {
                let response = Response::ok(cseq);
                if self.owns(request) {
                    response.with_header("Session", self.session_header())
                } else {
                    response
                }
            }
            _ => Response::new(501, cseq).with_header("Public", PUBLIC_METHODS),
        }
    }

    async fn describe(&self, request: &Request, cseq: Option<u32>) -> Response {
        let Some(mount) = self.shared.resolve(request.path()).await else {
            return Response::new(404, cseq);
        };
        let params = mount.parameter_sets().await;
        let sdp = SessionDescription {
            session_id: self.shared.next_session_id(),
            address: &self.shared.address,
            name: &mount.path,
            payload_type: mount.feed.payload_type,
            clock_rate: mount.feed.clock_rate,
            sps: params.sps.as_deref(),
            pps: params.pps.as_deref(),
        }
        .render();

        let base = if request.uri.ends_with('/') {
            request.uri.clone()
        } else {
            format!("{}/", request.uri)
        };
        Response::ok(cseq)
            .with_header("Content-Base", base)
            .with_body("application/sdp", sdp)
    }

    async fn setup(&mut self, request: &Request, cseq: Option<u32>) -> Response {
        if request.session().is_some() && !self.owns(request) {
            return Response::new(454, cseq);
        }
        let Some(mount) = self.shared.resolve(request.path()).await else {
            return Response::new(404, cseq);
        };
        if let Some(current) = &self.mount {
            if !Arc::ptr_eq(current, &mount) {
                return Response::new(459, cseq);
            }
        }
        let Some(transport) = request.header("Transport").and_then(Transport::parse) else {
            return Response::new(461, cseq);
        };

        let mut server_port = 0;
        if let Transport::Udp { .. } = transport {
            if self.udp.is_none() {
                match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
                    Ok(socket) => self.udp = Some(socket),
                    Err(e) => {
                        warn!("Publisher: cannot open RTP socket for {}: {}", self.peer, e);
                        return Response::new(500, cseq);
                    }
                }
            }
            server_port = self
                .udp
                .as_ref()
                .and_then(|s| s.local_addr().ok())
                .map_or(0, |a| a.port());
        }

        self.mount = Some(mount);
        self.transport = Some(transport);
        Response::ok(cseq)
            .with_header("Transport", transport.describe(server_port))
            .with_header("Session", self.session_header())
    }

    fn play(&mut self, request: &Request, cseq: Option<u32>) -> Response {
        if !self.owns(request) {
            return Response::new(454, cseq);
        }
        let (Some(mount), Some(transport)) = (self.mount.clone(), self.transport) else {
            return Response::new(455, cseq);
        };

        let response = Response::ok(cseq)
            .with_header("Session", self.session_header())
            .with_header("Range", "npt=now-");
        if self.interleaved.is_some() || self.forwarder.is_some() {
            return response;
        }

        let packets = mount.packets.subscribe();
        match transport {
            Transport::Interleaved { rtp_channel, .. } => {
                self.interleaved = Some(Interleaved {
                    channel: rtp_channel,
                    packets,
                    ended: mount.cancel.clone(),
                });
            }
            Transport::Udp { rtp_port, .. } => {
                let Some(socket) = self.udp.take() else {
                    return Response::new(455, cseq);
                };
                let target = SocketAddr::new(self.peer.ip(), rtp_port);
                let cancel = mount.cancel.child_token();
                self.forwarder = Some(tokio::spawn(forward_udp(socket, target, packets, cancel)));
            }
        }
        info!("Publisher: {} playing {} ({})", self.peer, mount.path, self.id);
        response
    }

    /// Next packet framed for the RTSP connection
    ///
    /// Pending when the session does not play over TCP; `None` once the
    /// mount is gone.
    async fn next_interleaved(&mut self) -> Option<Vec<u8>> {
        let Some(play) = self.interleaved.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            let received = tokio::select! {
                _ = play.ended.cancelled() => Err(RecvError::Closed),
                received = play.packets.recv() => received,
            };
            match received {
                Ok(packet) => {
                    let Ok(len) = u16::try_from(packet.len()) else {
                        debug!("Publisher: {} skipping a {} byte packet", self.peer, packet.len());
                        continue;
                    };
                    let mut frame = Vec::with_capacity(4 + packet.len());
                    frame.push(b'$');
                    frame.push(play.channel);
                    frame.extend_from_slice(&len.to_be_bytes());
                    frame.extend_from_slice(&packet);
                    return Some(frame);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Publisher: {} lagging, skipped {} packets", self.peer, skipped);
                }
                Err(RecvError::Closed) => {
                    self.interleaved = None;
                    return None;
                }
            }
        }
    }

    fn stop(&mut self) {
        self.interleaved = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

async fn forward_udp(
    socket: UdpSocket,
    target: SocketAddr,
    mut packets: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut sent = 0u64;
    let mut failed = 0u64;
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = packets.recv() => packet,
        };
        match packet {
            Ok(packet) => match socket.send_to(&packet, target).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    failed += 1;
                    if failed.is_power_of_two() {
                        warn!("Publisher: send to {} failed ({} so far): {}", target, failed, e);
                    }
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                debug!("Publisher: {} lagging, skipped {} packets", target, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("Publisher: stopped sending to {} after {} packets", target, sent);
}
