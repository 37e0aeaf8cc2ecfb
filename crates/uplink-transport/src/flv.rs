//! FLV tag bodies for RTMP video and audio messages.
//!
//! RTMP carries H.264 as length-prefixed (AVCC) NAL units inside an FLV
//! video tag body, and AAC inside an FLV audio tag body. Each codec needs a
//! sequence header before any media data.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;
use uplink_encoder::nal::{self, NalUnit};
use uplink_encoder::CodecConfig;

/// FLV codec id for AVC.
const CODEC_AVC: u8 = 0x07;
/// FLV frame types, upper nibble.
const FRAME_KEY: u8 = 0x10;
const FRAME_INTER: u8 = 0x20;

/// AVC packet types.
const AVC_SEQUENCE_HEADER: u8 = 0x00;
const AVC_NALU: u8 = 0x01;

/// AAC, 44 kHz, 16-bit, stereo. FLV requires these flags for AAC whatever
/// the actual format; the AudioSpecificConfig carries the real values.
const AAC_SOUND_FLAGS: u8 = 0xAF;

/// `videocodecid` announced in `onMetaData`.
pub const AVC_CODEC_ID: u32 = CODEC_AVC as u32;
/// `audiocodecid` announced in `onMetaData`: the sound format nibble.
pub const AAC_SOUND_FORMAT: u32 = (AAC_SOUND_FLAGS >> 4) as u32;
const AAC_SEQUENCE_HEADER: u8 = 0x00;
const AAC_RAW: u8 = 0x01;

/// MPEG-4 audio object type for AAC-LC.
const AAC_LC: u16 = 2;

/// Sampling frequency table from ISO 14496-3.
const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
    7_350,
];

/// Length-prefix every NAL unit with its 4-byte big-endian size.
pub fn nals_to_avcc(nals: &[NalUnit]) -> Bytes {
    let total: usize = nals.iter().map(|n| 4 + n.data.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// AVCDecoderConfigurationRecord (ISO 14496-15) for one SPS and one PPS.
///
/// Returns `None` if the SPS is too short to carry profile and level.
pub fn avc_decoder_config(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    if sps.len() < 4 {
        debug!(len = sps.len(), "SPS too short for decoder config");
        return None;
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01); // version
    buf.put_slice(&sps[1..4]); // profile, compatibility, level
    buf.put_u8(0xFC | 0x03); // 4-byte NAL lengths
    buf.put_u8(0xE0 | 0x01); // one SPS
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01); // one PPS
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    Some(buf.freeze())
}

/// Wrap an AVC payload in a video tag body.
pub fn video_tag(body: &[u8], is_key_unit: bool, is_sequence_header: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    let frame_type = if is_key_unit { FRAME_KEY } else { FRAME_INTER };
    buf.put_u8(frame_type | CODEC_AVC);
    buf.put_u8(if is_sequence_header {
        AVC_SEQUENCE_HEADER
    } else {
        AVC_NALU
    });
    // Composition time offset; no B-frames on a live uplink.
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(body);
    buf.freeze()
}

/// Video tag carrying the AVC sequence header for `config`.
pub fn avc_sequence_header(config: &CodecConfig) -> Option<Bytes> {
    avc_decoder_config(&config.sps, &config.pps).map(|record| video_tag(&record, true, true))
}

/// Video tag for one Annex B access unit.
///
/// In-band SPS/PPS/AUD are stripped. Returns `None` when nothing is left
/// to send.
pub fn avc_frame_tag(annex_b: &[u8], is_key_unit: bool) -> Option<Bytes> {
    let nals = nal::filter_parameter_sets(nal::parse_annex_b(annex_b));
    if nals.is_empty() {
        return None;
    }
    Some(video_tag(&nals_to_avcc(&nals), is_key_unit, false))
}

/// Two-byte AudioSpecificConfig for AAC-LC.
pub fn aac_audio_specific_config(sample_rate: u32, channels: u32) -> Option<[u8; 2]> {
    let index = AAC_SAMPLE_RATES.iter().position(|&r| r == sample_rate)? as u16;
    if channels == 0 || channels > 7 {
        return None;
    }
    let bits = (AAC_LC << 11) | (index << 7) | ((channels as u16) << 3);
    Some(bits.to_be_bytes())
}

/// Audio tag carrying the AAC sequence header.
pub fn aac_sequence_header(sample_rate: u32, channels: u32) -> Option<Bytes> {
    let asc = aac_audio_specific_config(sample_rate, channels)?;
    Some(audio_tag(AAC_SEQUENCE_HEADER, &asc))
}

/// Audio tag for one raw AAC frame.
pub fn aac_frame_tag(data: &[u8]) -> Bytes {
    audio_tag(AAC_RAW, data)
}

fn audio_tag(packet_type: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u8(AAC_SOUND_FLAGS);
    buf.put_u8(packet_type);
    buf.put_slice(body);
    buf.freeze()
}
