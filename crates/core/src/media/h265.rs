//! H.265 (HEVC) RTP payload format (RFC 7798).
//!
//! Differences from H.264 ([`super::h264`]):
//!
//! - **2-byte NAL unit header**: `[F|Type(6)|LayerId(6)|TID(3)]`.
//! - **Aggregation Packet** (§4.4.2, type 48): 2-byte payload header, then
//!   size-prefixed NAL units. F is the OR of the aggregated F bits; LayerId
//!   and TID are the lowest values among them.
//! - **Fragmentation Unit** (§4.4.3, type 49): 2-byte payload header
//!   copied from the NAL with the type replaced, then a 1-byte FU header
//!   `[S|E|FuType(6)]`. The original 2-byte NAL header is not repeated.

use super::{Codec, NalPayloader};

pub const AP: u8 = 48;
pub const FU: u8 = 49;

/// NAL unit type from the 2-byte header.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| (b >> 1) & 0x3f)
}

/// VCL NAL units (types 0 to 31).
pub fn is_vcl(nal: &[u8]) -> bool {
    nal.len() >= 2 && matches!(nal_type(nal), Some(0..=31))
}

/// Non-VCL types that open an access unit: VPS, SPS, PPS, AUD, prefix SEI
/// and reserved 41..44.
pub fn is_unit_prefix(nal: &[u8]) -> bool {
    matches!(nal_type(nal), Some(32..=35 | 39 | 41..=44))
}

/// Whether a VCL NAL carries `first_slice_segment_in_pic_flag`.
pub fn starts_picture(nal: &[u8]) -> bool {
    is_vcl(nal) && nal.get(2).is_some_and(|b| b & 0x80 != 0)
}

fn layer_id(nal: &[u8]) -> u8 {
    ((nal[0] & 0x01) << 5) | (nal[1] >> 3)
}

fn tid(nal: &[u8]) -> u8 {
    nal[1] & 0x07
}

#[derive(Debug, Default, Clone, Copy)]
pub struct H265Payloader;

impl NalPayloader for H265Payloader {
    fn codec(&self) -> Codec {
        Codec::H265
    }

    fn nal_header_len(&self) -> usize {
        2
    }

    fn fragment_prefix_len(&self) -> usize {
        3
    }

    fn fragment_prefix(&self, nal: &[u8], start: bool, end: bool, out: &mut Vec<u8>) {
        let fu_type = (nal[0] >> 1) & 0x3f;

        out.push((nal[0] & 0x81) | (FU << 1));
        out.push(nal[1]);

        let start_bit = if start { 0x80 } else { 0x00 };
        let end_bit = if end { 0x40 } else { 0x00 };
        out.push(start_bit | end_bit | fu_type);
    }

    fn aggregation_header_len(&self) -> usize {
        2
    }

    fn aggregation_header(&self, nals: &[&[u8]], out: &mut Vec<u8>) {
        let mut f = 0u8;
        let mut layer = u8::MAX;
        let mut temporal = u8::MAX;
        for nal in nals.iter().filter(|n| n.len() >= 2) {
            f |= nal[0] & 0x80;
            layer = layer.min(layer_id(nal));
            temporal = temporal.min(tid(nal));
        }
        if layer == u8::MAX {
            layer = 0;
            temporal = 1;
        }

        out.push(f | (AP << 1) | (layer >> 5));
        out.push(((layer & 0x1f) << 3) | temporal);
    }
}
