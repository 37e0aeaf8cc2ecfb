//! H.264 Annex B parsing.
//!
//! Encoders emit H.264 as an **Annex B** byte stream: NAL units separated by
//! start codes (0x000001 or 0x00000001). This module splits such a stream
//! into NAL units and groups them into access units (one encoded picture
//! each), which is the granularity the streaming engine queues and sends.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

/// Four-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P/B frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(byte: u8) -> Self {
        match byte & 0x1F {
            1 => NalUnitType::NonIdrSlice,
            5 => NalUnitType::IdrSlice,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            _ => NalUnitType::Other,
        }
    }
}

impl NalUnitType {
    /// Returns true for coded slice NAL units.
    pub fn is_slice(self) -> bool {
        matches!(self, Self::NonIdrSlice | Self::IdrSlice)
    }

    /// Returns true for SPS/PPS.
    pub fn is_parameter_set(self) -> bool {
        matches!(self, Self::Sps | Self::Pps)
    }
}

/// A single NAL unit extracted from an Annex B stream.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// The NAL unit type.
    pub nal_type: NalUnitType,
    /// The NAL unit data (including the NAL header byte, excluding start code).
    pub data: Bytes,
}

impl NalUnit {
    /// True if this slice starts a new picture (`first_mb_in_slice == 0`).
    ///
    /// `first_mb_in_slice` is the first ue(v) field after the header byte; a
    /// leading 1 bit encodes the value 0.
    fn starts_picture(&self) -> bool {
        self.nal_type.is_slice() && self.data.len() > 1 && self.data[1] & 0x80 != 0
    }
}

/// An encoded picture: every NAL unit belonging to one frame.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// NAL units in stream order.
    pub nals: Vec<NalUnit>,
}

impl AccessUnit {
    /// True if the picture is an IDR picture.
    pub fn is_key_unit(&self) -> bool {
        self.nals.iter().any(|n| n.nal_type == NalUnitType::IdrSlice)
    }

    /// Re-serialize as Annex B with 4-byte start codes.
    pub fn to_annex_b(&self) -> Bytes {
        join_annex_b(self.nals.iter().map(|n| n.data.as_ref()))
    }

    fn has_slice(&self) -> bool {
        self.nals.iter().any(|n| n.nal_type.is_slice())
    }
}

/// Parse an Annex B byte stream into individual NAL units.
///
/// Returns NAL units without their start codes. Bytes before the first
/// start code are ignored.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let mut nals = Vec::new();
    let mut i = 0;
    let len = data.len();

    while i < len {
        // Find start code (0x000001 or 0x00000001)
        let start_code_len = if i + 3 < len && data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                3
            } else if i + 4 <= len && data[i + 2] == 0 && data[i + 3] == 1 {
                4
            } else {
                i += 1;
                continue;
            }
        } else {
            i += 1;
            continue;
        };

        let nal_start = i + start_code_len;

        let mut nal_end = len;
        let mut j = nal_start;
        while j + 2 < len {
            if data[j] == 0
                && data[j + 1] == 0
                && (data[j + 2] == 1 || (j + 3 < len && data[j + 2] == 0 && data[j + 3] == 1))
            {
                nal_end = j;
                break;
            }
            j += 1;
        }

        if nal_start < nal_end {
            let nal_data = &data[nal_start..nal_end];
            nals.push(NalUnit {
                nal_type: NalUnitType::from(nal_data[0]),
                data: Bytes::copy_from_slice(nal_data),
            });
        }

        i = nal_end;
    }

    nals
}

/// Group NAL units into access units.
///
/// A new access unit begins at an AUD, at a parameter set that follows a
/// slice, or at a slice whose `first_mb_in_slice` is zero when the current
/// unit already holds a slice.
pub fn split_access_units(nals: Vec<NalUnit>) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current = AccessUnit { nals: Vec::new() };

    for nal in nals {
        let boundary = current.has_slice()
            && (nal.nal_type == NalUnitType::Aud
                || nal.nal_type.is_parameter_set()
                || nal.nal_type == NalUnitType::Sei
                || nal.starts_picture());

        if boundary {
            units.push(std::mem::replace(&mut current, AccessUnit { nals: Vec::new() }));
        }
        current.nals.push(nal);
    }

    if current.has_slice() {
        units.push(current);
    }

    units
}

/// Extract SPS and PPS NAL units from Annex B data.
///
/// The last SPS and PPS seen win.
pub fn extract_sps_pps(annex_b: &[u8]) -> Option<(Bytes, Bytes)> {
    let mut sps: Option<Bytes> = None;
    let mut pps: Option<Bytes> = None;

    for nal in parse_annex_b(annex_b) {
        match nal.nal_type {
            NalUnitType::Sps => {
                debug!(len = nal.data.len(), "Found SPS NAL unit");
                sps = Some(nal.data);
            }
            NalUnitType::Pps => {
                debug!(len = nal.data.len(), "Found PPS NAL unit");
                pps = Some(nal.data);
            }
            _ => {}
        }
    }

    match (sps, pps) {
        (Some(s), Some(p)) => Some((s, p)),
        _ => None,
    }
}

/// Filter NAL units, removing SPS/PPS/AUD.
///
/// Parameter sets travel out of band as codec config, so they are stripped
/// from the per-frame payload.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| !nal.nal_type.is_parameter_set() && nal.nal_type != NalUnitType::Aud)
        .collect()
}

/// Join NAL payloads into an Annex B stream with 4-byte start codes.
pub fn join_annex_b<'a>(nals: impl IntoIterator<Item = &'a [u8]>) -> Bytes {
    let mut buf = BytesMut::new();
    for nal in nals {
        buf.put_slice(&START_CODE);
        buf.put_slice(nal);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1E];
    const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];

    fn stream(nals: &[&[u8]]) -> Vec<u8> {
        join_annex_b(nals.iter().copied()).to_vec()
    }

    #[test]
    fn test_parse_annex_b_3byte_start_code() {
        let data = [0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E];
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NalUnitType::Sps);
        assert_eq!(nals[0].data.as_ref(), &SPS);
    }

    #[test]
    fn test_parse_annex_b_multiple_nals() {
        let data = stream(&[&SPS, &PPS]);
        let nals = parse_annex_b(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal_type, NalUnitType::Sps);
        assert_eq!(nals[1].nal_type, NalUnitType::Pps);
    }

    #[test]
    fn test_extract_sps_pps_requires_both() {
        let (sps, pps) = extract_sps_pps(&stream(&[&SPS, &PPS])).unwrap();
        assert_eq!(sps.as_ref(), &SPS);
        assert_eq!(pps.as_ref(), &PPS);

        assert!(extract_sps_pps(&stream(&[&SPS])).is_none());
    }

    #[test]
    fn test_split_access_units_groups_by_picture() {
        // SPS PPS IDR | P | P(two slices)
        let idr = [0x65, 0x88, 0x84];
        let p1 = [0x41, 0x9A, 0x01];
        let p2_first = [0x41, 0x9A, 0x02];
        let p2_second = [0x41, 0x12, 0x03]; // first_mb_in_slice != 0
        let data = stream(&[&SPS, &PPS, &idr, &p1, &p2_first, &p2_second]);

        let units = split_access_units(parse_annex_b(&data));
        assert_eq!(units.len(), 3);
        assert!(units[0].is_key_unit());
        assert_eq!(units[0].nals.len(), 3);
        assert!(!units[1].is_key_unit());
        assert_eq!(units[2].nals.len(), 2);
    }

    #[test]
    fn test_filter_parameter_sets() {
        let data = stream(&[&SPS, &PPS, &[0x09, 0xF0], &[0x65, 0x88]]);
        let filtered = filter_parameter_sets(parse_annex_b(&data));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].nal_type, NalUnitType::IdrSlice);
    }

    #[test]
    fn test_access_unit_round_trips_to_annex_b() {
        let data = stream(&[&[0x65, 0x88, 0x84]]);
        let units = split_access_units(parse_annex_b(&data));
        assert_eq!(units[0].to_annex_b().as_ref(), data.as_slice());
    }
}
