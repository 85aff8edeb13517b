//! RTSP re-publishing of the pipeline's RTP output
//!
//! Each mount relays the RTP packets arriving on a UDP address to every
//! viewer. Packets are fanned out through a broadcast channel, so a slow
//! viewer skips packets instead of holding up the relay or other viewers.

pub mod rtsp;
mod session;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PublishError;
use crate::h264::{self, NAL_PPS, NAL_SPS};
use crate::stages::rtp::rtp_payload;

const RELAY_CAPACITY: usize = 1024;
const MAX_DATAGRAM: usize = 65_536;

/// Where a mount reads its packets from and how they are described
#[derive(Debug, Clone, PartialEq)]
pub struct RelayFeed {
    pub relay: SocketAddr,
    pub payload_type: u8,
    pub clock_rate: u32,
}

impl RelayFeed {
    /// H.264 over RTP with the 90 kHz video clock
    pub fn h264(relay: SocketAddr, payload_type: u8) -> Self {
        Self {
            relay,
            payload_type,
            clock_rate: 90_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

struct Mount {
    path: String,
    feed: RelayFeed,
    packets: broadcast::Sender<Bytes>,
    params: RwLock<ParameterSets>,
    cancel: CancellationToken,
}

impl Mount {
    async fn parameter_sets(&self) -> ParameterSets {
        self.params.read().await.clone()
    }

    /// Remember SPS/PPS sent as single NAL packets, for the SDP
    async fn learn(&self, packet: &[u8]) {
        let Some(payload) = rtp_payload(packet) else {
            return;
        };
        let Some(header) = payload.first() else {
            return;
        };
        match h264::nal_type(*header) {
            NAL_SPS => {
                let mut params = self.params.write().await;
                if params.sps.as_ref() != Some(&payload) {
                    debug!("Publisher: {} got new SPS", self.path);
                    params.sps = Some(payload);
                }
            }
            NAL_PPS => {
                let mut params = self.params.write().await;
                if params.pps.as_ref() != Some(&payload) {
                    params.pps = Some(payload);
                }
            }
            _ => {}
        }
    }
}

struct Shared {
    mounts: RwLock<HashMap<String, Arc<Mount>>>,
    cancel: CancellationToken,
    ids: AtomicU64,
    /// Address advertised in session descriptions
    address: String,
}

impl Shared {
    fn next_session_id(&self) -> u64 {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        nanos ^ self.ids.fetch_add(1, Ordering::Relaxed).rotate_left(40)
    }

    /// Mount for a request path, also matching per-track control URLs
    async fn resolve(&self, path: &str) -> Option<Arc<Mount>> {
        let mounts = self.mounts.read().await;
        let path = path.trim_end_matches('/');
        if let Some(mount) = mounts.get(path) {
            return Some(mount.clone());
        }
        let (base, _track) = path.rsplit_once('/')?;
        mounts.get(base).cloned()
    }
}

/// Minimal RTSP server exposing relayed feeds at mount paths
pub struct StreamPublisher {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPublisher {
    /// Start listening for RTSP clients
    pub async fn bind(addr: SocketAddr) -> Result<Self, PublishError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PublishError::from_bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let address = local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string());
        let shared = Arc::new(Shared {
            mounts: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            ids: AtomicU64::new(1),
            address,
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));
        info!("Publisher: listening on {}", local_addr);

        Ok(Self {
            local_addr,
            shared,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL viewers should open for a mount
    pub fn url(&self, mount: &str) -> String {
        let host = if self.local_addr.ip().is_unspecified() {
            self.shared.address.clone()
        } else {
            self.local_addr.ip().to_string()
        };
        format!("rtsp://{}:{}{}", host, self.local_addr.port(), mount)
    }

    /// Serve the packets arriving at `feed.relay` under `mount`
    pub async fn publish(&self, mount: &str, feed: RelayFeed) -> Result<(), PublishError> {
        if !mount.starts_with('/') || mount.len() < 2 {
            return Err(PublishError::InvalidMount(mount.to_string()));
        }
        let path = mount.trim_end_matches('/').to_string();

        let mut mounts = self.shared.mounts.write().await;
        if mounts.contains_key(&path) {
            return Err(PublishError::AlreadyMounted(path));
        }
        let socket = bind_relay(feed.relay).await?;

        let (packets, _) = broadcast::channel(RELAY_CAPACITY);
        let entry = Arc::new(Mount {
            path: path.clone(),
            feed,
            packets,
            params: RwLock::new(ParameterSets::default()),
            cancel: self.shared.cancel.child_token(),
        });
        tokio::spawn(relay(socket, entry.clone()));
        info!(
            "Publisher: {} relaying {} at {}",
            path,
            entry.feed.relay,
            self.url(&path)
        );
        mounts.insert(path, entry);
        Ok(())
    }

    /// Stop serving a mount; connected viewers stop receiving packets
    pub async fn unpublish(&self, mount: &str) -> Result<(), PublishError> {
        let path = mount.trim_end_matches('/');
        let removed = self.shared.mounts.write().await.remove(path);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                info!("Publisher: {} unpublished", path);
                Ok(())
            }
            None => Err(PublishError::NotMounted(path.to_string())),
        }
    }

    pub async fn mounts(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.shared.mounts.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Close the listener, every session and every relay
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.mounts.write().await.clear();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
            info!("Publisher: stopped");
        }
    }
}

async fn bind_relay(addr: SocketAddr) -> Result<UdpSocket, PublishError> {
    match addr.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            let any = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
            let socket = UdpSocket::bind(any)
                .await
                .map_err(|e| PublishError::from_bind(addr, e))?;
            socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
            Ok(socket)
        }
        _ => UdpSocket::bind(addr)
            .await
            .map_err(|e| PublishError::from_bind(addr, e)),
    }
}

async fn relay(socket: UdpSocket, mount: Arc<Mount>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut relayed = 0u64;
    let mut errors = 0u64;

    loop {
        tokio::select! {
            _ = mount.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, _)) => {
                    let packet = Bytes::copy_from_slice(&buf[..n]);
                    mount.learn(&packet).await;
                    // no viewers yet is fine
                    let _ = mount.packets.send(packet);
                    relayed += 1;
                }
                Err(e) => {
                    errors += 1;
                    if errors.is_power_of_two() {
                        warn!("Publisher: relay for {} failed to receive ({} so far): {}", mount.path, errors, e);
                    }
                }
            }
        }
    }

    info!("Publisher: relay for {} finished after {} packets", mount.path, relayed);
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Publisher: connection from {}", peer);
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = session::serve(stream, peer, shared).await {
                            warn!("Publisher: session with {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Publisher: accept failed: {}", e),
            }
        }
    }
}
