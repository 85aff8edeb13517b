//! RTP payloading for H.264 (RFC 6184)

use anyhow::{Result, bail};
use bytes::{BufMut, Bytes, BytesMut};

use crate::h264::{self, nal_units};
use crate::pipeline::caps::{Caps, CapsSet, Format, MediaType};
use crate::pipeline::stage::{StageKind, Transform};
use crate::pipeline::types::{Buffer, Packet, Timestamp};

use super::parse::h264_au_caps;

pub const RTP_HEADER_LEN: usize = 12;
pub const DEFAULT_MTU: usize = 1400;
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;
const FU_A: u8 = 28;

/// Caps of an H.264 RTP stream with the given payload type
pub fn rtp_h264_caps(payload_type: u8) -> Caps {
    Caps::new(MediaType::Rtp)
        .with_param("media", "video")
        .with_param("clock-rate", "90000")
        .with_param("encoding-name", "H264")
        .with_param("payload", &payload_type.to_string())
}

/// Splits access units into RTP packets
///
/// NAL units that fit in one packet go out whole; larger ones are split
/// into FU-A fragments. The marker bit is set on the last packet of each
/// access unit.
pub struct RtpPayloader {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
}

impl RtpPayloader {
    pub fn new(mtu: usize, payload_type: u8, ssrc: u32) -> Result<Self> {
        if mtu <= RTP_HEADER_LEN + 2 {
            bail!("mtu {} leaves no room for payload", mtu);
        }
        if payload_type > 127 {
            bail!("payload type {} does not fit in 7 bits", payload_type);
        }
        Ok(Self {
            mtu,
            payload_type,
            ssrc,
            sequence: 0,
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn packet(&mut self, pts: Timestamp, marker: bool, parts: &[&[u8]]) -> Packet {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let mut data = BytesMut::with_capacity(RTP_HEADER_LEN + len);
        let marker_bit = if marker { 0x80 } else { 0 };
        data.put_u8(0x80);
        data.put_u8(marker_bit | self.payload_type);
        data.put_u16(self.sequence);
        data.put_u32(pts.to_rtp_clock());
        data.put_u32(self.ssrc);
        for part in parts {
            data.put_slice(part);
        }
        let packet = Packet {
            data: data.freeze(),
            pts,
            sequence_number: self.sequence,
            marker,
        };
        self.sequence = self.sequence.wrapping_add(1);
        packet
    }

    /// Packetize one Annex B access unit
    pub fn payload(&mut self, access_unit: &[u8], pts: Timestamp) -> Vec<Packet> {
        let max_payload = self.mtu - RTP_HEADER_LEN;
        let nals: Vec<&[u8]> = nal_units(access_unit).collect();
        let mut packets = Vec::new();

        for (i, nal) in nals.iter().enumerate() {
            let last_nal = i + 1 == nals.len();
            if nal.len() <= max_payload {
                packets.push(self.packet(pts, last_nal, &[*nal]));
                continue;
            }

            let indicator = (nal[0] & 0xE0) | FU_A;
            let kind = h264::nal_type(nal[0]);
            let chunks: Vec<&[u8]> = nal[1..].chunks(max_payload - 2).collect();
            for (j, chunk) in chunks.iter().enumerate() {
                let start = j == 0;
                let end = j + 1 == chunks.len();
                let mut header = kind;
                if start {
                    header |= 0x80;
                }
                if end {
                    header |= 0x40;
                }
                packets.push(self.packet(pts, last_nal && end, &[&[indicator, header][..], *chunk]));
            }
        }
        packets
    }
}

impl Transform for RtpPayloader {
    fn kind(&self) -> StageKind {
        StageKind::Packetizer
    }

    fn sink_caps(&self) -> CapsSet {
        h264_au_caps().into()
    }

    fn src_caps(&self, _input: Option<&Format>) -> CapsSet {
        rtp_h264_caps(self.payload_type).into()
    }

    fn transform(&mut self, buffer: Buffer, out: &mut Vec<Buffer>) -> Result<()> {
        let Buffer::Frame(frame) = buffer else {
            bail!("payloader expects access units, got a {}", buffer.kind());
        };
        out.extend(self.payload(&frame.data, frame.pts).into_iter().map(Buffer::Packet));
        Ok(())
    }
}

/// Payload of an RTP packet, past the fixed header and CSRC list
pub fn rtp_payload(packet: &[u8]) -> Option<Bytes> {
    if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    let csrc = (packet[0] & 0x0F) as usize * 4;
    let start = RTP_HEADER_LEN + csrc;
    (packet.len() >= start).then(|| Bytes::copy_from_slice(&packet[start..]))
}
