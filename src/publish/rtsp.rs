//! RTSP/1.0 message parsing and formatting (RFC 2326)

use std::fmt::Write as _;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub const VERSION: &str = "RTSP/1.0";
pub const SERVER: &str = concat!("aerocast/", env!("CARGO_PKG_VERSION"));
pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

const MAX_HEAD_LEN: usize = 16 * 1024;
const MAX_BODY_LEN: usize = 64 * 1024;

/// A parsed client request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    /// Parse the request line and headers
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.split("\r\n").map(|l| l.trim_end_matches('\n'));
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
            bail!("malformed request line '{}'", request_line);
        };
        if version != VERSION {
            bail!("unsupported protocol version '{}'", version);
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed header line '{}'", line))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            uri: uri.to_string(),
            headers,
            body: Vec::new(),
        })
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.parse().ok())
    }

    /// Session id without its `;timeout=` suffix
    pub fn session(&self) -> Option<&str> {
        self.header("Session").map(|v| v.split(';').next().unwrap_or(v).trim())
    }

    fn content_length(&self) -> Result<usize> {
        match self.header("Content-Length") {
            None => Ok(0),
            Some(v) => v.parse().with_context(|| format!("bad Content-Length '{}'", v)),
        }
    }

    /// Path component of the request URI
    pub fn path(&self) -> &str {
        uri_path(&self.uri)
    }
}

/// Path of an `rtsp://host:port/path` URI (or of a bare path)
pub fn uri_path(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtspu://"))
        .map(|r| r.find('/').map_or("/", |i| &r[i..]))
        .unwrap_or(uri);
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    if rest.is_empty() { "/" } else { rest }
}

/// Something read off a client connection
#[derive(Debug)]
pub enum Incoming {
    Request(Request),
    /// Interleaved binary data from the client (RTCP receiver reports)
    Interleaved { channel: u8, len: usize },
}

/// Read the next request, skipping over interleaved binary frames
///
/// Returns `None` when the peer closed the connection.
pub async fn read_incoming<R>(reader: &mut R) -> Result<Option<Incoming>>
where
    R: AsyncBufRead + Unpin,
{
    let first = match reader.fill_buf().await?.first() {
        Some(b) => *b,
        None => return Ok(None),
    };

    if first == b'$' {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut skipped = vec![0u8; len];
        reader.read_exact(&mut skipped).await?;
        return Ok(Some(Incoming::Interleaved {
            channel: header[1],
            len,
        }));
    }

    let mut head = String::new();
    loop {
        let n = reader.read_line(&mut head).await?;
        if n == 0 {
            return Ok(None);
        }
        if head.len() > MAX_HEAD_LEN {
            bail!("request head exceeds {} bytes", MAX_HEAD_LEN);
        }
        if head.ends_with("\r\n\r\n") || head.ends_with("\n\n") {
            break;
        }
        // tolerate stray blank lines between requests
        if head.trim().is_empty() {
            head.clear();
        }
    }

    let mut request = Request::parse(head.trim_end())?;
    let len = request.content_length()?;
    if len > MAX_BODY_LEN {
        bail!("request body of {} bytes is too large", len);
    }
    if len > 0 {
        request.body = vec![0u8; len];
        reader.read_exact(&mut request.body).await?;
    }
    Ok(Some(Incoming::Request(request)))
}

/// A response under construction
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Response {
    pub fn new(status: u16, cseq: Option<u32>) -> Self {
        let mut response = Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        };
        if let Some(cseq) = cseq {
            response = response.with_header("CSeq", cseq);
        }
        response
            .with_header("Server", SERVER)
            .with_header("Date", chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT"))
    }

    pub fn ok(cseq: Option<u32>) -> Self {
        Self::new(200, cseq)
    }

    pub fn with_header(mut self, name: &str, value: impl std::fmt::Display) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(self, content_type: &str, body: String) -> Self {
        let mut response = self
            .with_header("Content-Type", content_type)
            .with_header("Content-Length", body.len());
        response.body = body;
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", VERSION, self.status, reason(self.status));
        for (name, value) in &self.headers {
            let _ = write!(out, "{}: {}\r\n", name, value);
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out.into_bytes()
    }
}

pub fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        459 => "Aggregate Operation Not Allowed",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// How the client wants to receive RTP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// UDP unicast to the client's RTP/RTCP port pair
    Udp { rtp_port: u16, rtcp_port: u16 },
    /// Interleaved in the RTSP connection
    Interleaved { rtp_channel: u8, rtcp_channel: u8 },
}

impl Transport {
    /// Pick the first acceptable alternative of a `Transport` header
    pub fn parse(header: &str) -> Option<Transport> {
        header.split(',').find_map(|entry| Self::parse_one(entry.trim()))
    }

    fn parse_one(entry: &str) -> Option<Transport> {
        let mut params = entry.split(';').map(str::trim);
        let protocol = params.next()?.to_ascii_uppercase();
        let params: Vec<&str> = params.collect();

        if params.iter().any(|p| p.eq_ignore_ascii_case("multicast")) {
            return None;
        }
        let value = |key: &str| {
            params.iter().find_map(|p| {
                let (k, v) = p.split_once('=')?;
                k.trim().eq_ignore_ascii_case(key).then(|| v.trim())
            })
        };

        match protocol.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => {
                let (rtp, rtcp) = port_pair(value("client_port")?)?;
                Some(Transport::Udp {
                    rtp_port: rtp,
                    rtcp_port: rtcp,
                })
            }
            "RTP/AVP/TCP" => {
                let (rtp, rtcp) = match value("interleaved") {
                    Some(v) => port_pair(v)?,
                    None => (0, 1),
                };
                Some(Transport::Interleaved {
                    rtp_channel: u8::try_from(rtp).ok()?,
                    rtcp_channel: u8::try_from(rtcp).ok()?,
                })
            }
            _ => None,
        }
    }

    /// Value of the `Transport` response header
    pub fn describe(&self, server_rtp_port: u16) -> String {
        match self {
            Transport::Udp { rtp_port, rtcp_port } => format!(
                "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                rtp_port,
                rtcp_port,
                server_rtp_port,
                server_rtp_port.wrapping_add(1)
            ),
            Transport::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp_channel, rtcp_channel),
        }
    }
}

fn port_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: u16 = value.trim().parse().ok()?;
            Some((a, a.wrapping_add(1)))
        }
    }
}

/// Session description for an H.264 RTP stream
pub struct SessionDescription<'a> {
    pub session_id: u64,
    pub address: &'a str,
    pub name: &'a str,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub sps: Option<&'a [u8]>,
    pub pps: Option<&'a [u8]>,
}

impl SessionDescription<'_> {
    pub fn render(&self) -> String {
        let mut sdp = String::new();
        let _ = write!(sdp, "v=0\r\n");
        let _ = write!(sdp, "o=- {} 1 IN IP4 {}\r\n", self.session_id, self.address);
        let _ = write!(sdp, "s={}\r\n", self.name);
        let _ = write!(sdp, "c=IN IP4 0.0.0.0\r\n");
        let _ = write!(sdp, "t=0 0\r\n");
        let _ = write!(sdp, "a=tool:{}\r\n", SERVER);
        let _ = write!(sdp, "a=type:broadcast\r\n");
        let _ = write!(sdp, "a=control:*\r\n");
        let _ = write!(sdp, "a=range:npt=now-\r\n");
        let _ = write!(sdp, "m=video 0 RTP/AVP {}\r\n", self.payload_type);
        let _ = write!(sdp, "a=rtpmap:{} H264/{}\r\n", self.payload_type, self.clock_rate);

        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.payload_type);
        if let Some(sps) = self.sps.filter(|s| s.len() >= 4) {
            let _ = write!(fmtp, ";profile-level-id={:02X}{:02X}{:02X}", sps[1], sps[2], sps[3]);
        }
        if let (Some(sps), Some(pps)) = (self.sps, self.pps) {
            let _ = write!(
                fmtp,
                ";sprop-parameter-sets={},{}",
                STANDARD.encode(sps),
                STANDARD.encode(pps)
            );
        }
        let _ = write!(sdp, "{}\r\n", fmtp);
        let _ = write!(sdp, "a=control:stream=0\r\n");
        sdp
    }
}
