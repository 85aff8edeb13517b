//! H.264 Annex B helpers
//!
//! NAL unit scanning, access-unit assembly from an arbitrary byte stream,
//! and parameter-set extraction for SDP.

use bytes::{BufMut, Bytes, BytesMut};

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

#[inline]
pub fn nal_type(header: u8) -> u8 {
    header & 0x1F
}

/// Position and length of the next start code at or after `from`
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Iterate over the NAL units of Annex B data, without start codes
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut next = find_start_code(data, 0).map(|(pos, len)| pos + len);
    std::iter::from_fn(move || {
        loop {
            let start = next?;
            let (end, following) = match find_start_code(data, start) {
                Some((pos, len)) => (pos, Some(pos + len)),
                None => (data.len(), None),
            };
            next = following;
            let nal = trim_trailing_zeros(&data[start..end]);
            if !nal.is_empty() {
                return Some(nal);
            }
        }
    })
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    &nal[..end]
}

/// Scan Annex B data for a NAL unit with the given type
pub fn contains_nal_type(data: &[u8], target_type: u8) -> bool {
    nal_units(data).any(|nal| nal_type(nal[0]) == target_type)
}

/// Check if Annex B data contains an IDR NAL unit
pub fn contains_idr(data: &[u8]) -> bool {
    contains_nal_type(data, NAL_IDR)
}

/// First SPS and PPS found in the data
pub fn parameter_sets(data: &[u8]) -> (Option<&[u8]>, Option<&[u8]>) {
    let mut sps = None;
    let mut pps = None;
    for nal in nal_units(data) {
        match nal_type(nal[0]) {
            NAL_SPS if sps.is_none() => sps = Some(nal),
            NAL_PPS if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }
    (sps, pps)
}

fn is_vcl(kind: u8) -> bool {
    (NAL_SLICE..=NAL_IDR).contains(&kind)
}

/// `first_mb_in_slice == 0`, i.e. the slice starts a new picture
fn is_first_slice(nal: &[u8]) -> bool {
    nal.get(1).is_some_and(|b| b & 0x80 != 0)
}

/// Assembles complete access units out of a chunked Annex B byte stream
///
/// An access unit ends when the next one begins: at an AUD, SPS, PPS or SEI
/// following picture data, or at the first slice of the next picture.
#[derive(Default)]
pub struct AccessUnitSplitter {
    pending: BytesMut,
    current: BytesMut,
    has_picture: bool,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every access unit it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();

        // Only NAL units followed by another start code are known complete
        let Some((first, first_len)) = find_start_code(&self.pending, 0) else {
            return out;
        };
        let mut start = first + first_len;
        let mut consumed = first;
        while let Some((pos, len)) = find_start_code(&self.pending, start) {
            let nal = trim_trailing_zeros(&self.pending[start..pos]).to_vec();
            self.push_nal(&nal, &mut out);
            consumed = pos;
            start = pos + len;
        }
        let _ = self.pending.split_to(consumed);
        out
    }

    /// Drain everything held back, at end-of-stream
    pub fn flush(&mut self) -> Vec<Bytes> {
        let rest = self.pending.split().freeze();
        let mut out = Vec::new();
        for nal in nal_units(&rest) {
            self.push_nal(nal, &mut out);
        }
        if !self.current.is_empty() {
            self.has_picture = false;
            out.push(self.current.split().freeze());
        }
        out
    }

    fn push_nal(&mut self, nal: &[u8], out: &mut Vec<Bytes>) {
        if nal.is_empty() {
            return;
        }
        let kind = nal_type(nal[0]);
        let starts_new = if is_vcl(kind) {
            self.has_picture && is_first_slice(nal)
        } else {
            self.has_picture && matches!(kind, NAL_AUD | NAL_SPS | NAL_PPS | NAL_SEI)
        };
        if starts_new && !self.current.is_empty() {
            out.push(self.current.split().freeze());
            self.has_picture = false;
        }
        self.current.put_slice(&START_CODE);
        self.current.put_slice(nal);
        if is_vcl(kind) {
            self.has_picture = true;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal access unit: optional SPS/PPS, then one slice
    pub(crate) fn access_unit(keyframe: bool, payload_len: usize) -> Vec<u8> {
        let mut au = Vec::new();
        if keyframe {
            au.extend_from_slice(&START_CODE);
            au.extend_from_slice(&[0x67, 0x42, 0x00, 0x1e]);
            au.extend_from_slice(&START_CODE);
            au.extend_from_slice(&[0x68, 0xce, 0x3c, 0x80]);
        }
        au.extend_from_slice(&START_CODE);
        au.push(if keyframe { 0x65 } else { 0x41 });
        au.push(0x88);
        au.extend((0..payload_len).map(|i| (i % 200 + 1) as u8));
        au
    }

    #[test]
    fn test_nal_units_with_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 1, 2, 0, 0, 1, 0x68, 3, 0, 0, 0, 1, 0x65, 4];
        let nals: Vec<_> = nal_units(&data).collect();
        assert_eq!(nals, vec![&[0x67, 1, 2][..], &[0x68, 3][..], &[0x65, 4][..]]);
        assert!(contains_idr(&data));
        assert!(!contains_idr(&access_unit(false, 10)));
    }

    #[test]
    fn test_parameter_sets() {
        let au = access_unit(true, 4);
        let (sps, pps) = parameter_sets(&au);
        assert_eq!(sps, Some(&[0x67, 0x42, 0x00, 0x1e][..]));
        assert_eq!(pps, Some(&[0x68, 0xce, 0x3c, 0x80][..]));
    }

    #[test]
    fn test_splitter_across_arbitrary_chunks() {
        let units: Vec<Vec<u8>> = (0..6).map(|i| access_unit(i % 3 == 0, 50 + i)).collect();
        let stream: Vec<u8> = units.concat();

        let mut splitter = AccessUnitSplitter::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(7) {
            out.extend(splitter.push(chunk));
        }
        out.extend(splitter.flush());

        assert_eq!(out.len(), units.len());
        for (got, expected) in out.iter().zip(&units) {
            assert_eq!(&got[..], &expected[..]);
        }
        assert!(contains_idr(&out[0]));
        assert!(!contains_idr(&out[1]));
    }

    #[test]
    fn test_flush_without_data() {
        let mut splitter = AccessUnitSplitter::new();
        assert!(splitter.push(&[1, 2, 3]).is_empty());
        assert!(splitter.flush().is_empty());
    }
}
