//! H.264 RTP payload format (RFC 6184).
//!
//! Three packet shapes are produced for H.264:
//!
//! - **Single NAL Unit** (§5.6): the NAL is the payload, as-is.
//!
//! - **STAP-A** (§5.7.1): several NALs of the same access unit in one
//!   payload, each prefixed by its 16-bit size:
//!
//!   ```text
//!   STAP-A header: [F|NRI|Type=24]            (1 byte)
//!   NALU 1 size:   [u16 big-endian]           (2 bytes)
//!   NALU 1 data:   [...]
//!   NALU 2 size ...
//!   ```
//!
//!   F is the OR of the aggregated F bits, NRI the maximum NRI.
//!
//! - **FU-A** (§5.8): a NAL larger than the payload budget is split into
//!   fragments, each carrying a 2-byte prefix before the NAL body (the
//!   original NAL header byte is not repeated):
//!
//!   ```text
//!   FU indicator:  [F|NRI|Type=28]     (1 byte)
//!   FU header:     [S|E|R|NAL_Type]    (1 byte)
//!   ```

use super::{Codec, NalPayloader};

pub const STAP_A: u8 = 24;
pub const FU_A: u8 = 28;

/// NAL unit type from the 1-byte header.
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1f)
}

/// Coded slice NAL units (types 1 to 5).
pub fn is_vcl(nal: &[u8]) -> bool {
    matches!(nal_type(nal), Some(1..=5))
}

/// Non-VCL types that may only appear before the first slice of an access
/// unit (SEI, SPS, PPS, access unit delimiter, prefix/subset SPS and
/// reserved 16..18).
pub fn is_unit_prefix(nal: &[u8]) -> bool {
    matches!(nal_type(nal), Some(6..=9 | 14..=18))
}

/// Whether a VCL NAL starts a new picture.
///
/// `first_mb_in_slice` is the first ue(v) field of the slice header; it is
/// zero exactly when the first bit after the NAL header is 1.
pub fn starts_picture(nal: &[u8]) -> bool {
    is_vcl(nal) && nal.get(1).is_some_and(|b| b & 0x80 != 0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct H264Payloader;

impl NalPayloader for H264Payloader {
    fn codec(&self) -> Codec {
        Codec::H264
    }

    fn nal_header_len(&self) -> usize {
        1
    }

    fn fragment_prefix_len(&self) -> usize {
        2
    }

    fn fragment_prefix(&self, nal: &[u8], start: bool, end: bool, out: &mut Vec<u8>) {
        let nal_header = nal[0];
        let fu_indicator = (nal_header & 0xe0) | FU_A;

        let start_bit = if start { 0x80 } else { 0x00 };
        let end_bit = if end { 0x40 } else { 0x00 };
        let fu_header = start_bit | end_bit | (nal_header & 0x1f);

        out.push(fu_indicator);
        out.push(fu_header);
    }

    fn aggregation_header_len(&self) -> usize {
        1
    }

    fn aggregation_header(&self, nals: &[&[u8]], out: &mut Vec<u8>) {
        let (f, nri) = nals
            .iter()
            .filter_map(|nal| nal.first())
            .fold((0u8, 0u8), |(f, nri), b| (f | (b & 0x80), nri.max(b & 0x60)));
        out.push(f | nri | STAP_A);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fu_a_prefix_first_middle_last() {
        let p = H264Payloader;
        let nal = [0x65, 0xAA];

        let mut first = Vec::new();
        p.fragment_prefix(&nal, true, false, &mut first);
        assert_eq!(first, vec![0x60 | FU_A, 0x80 | 5]);

        let mut middle = Vec::new();
        p.fragment_prefix(&nal, false, false, &mut middle);
        assert_eq!(middle, vec![0x60 | FU_A, 5]);

        let mut last = Vec::new();
        p.fragment_prefix(&nal, false, true, &mut last);
        assert_eq!(last, vec![0x60 | FU_A, 0x40 | 5]);
    }

    #[test]
    fn stap_a_header_takes_max_nri() {
        let p = H264Payloader;
        let sei: &[u8] = &[0x06, 0x05];
        let sps: &[u8] = &[0x67, 0x42];
        let mut out = Vec::new();
        p.aggregation_header(&[sei, sps], &mut out);
        assert_eq!(out, vec![0x60 | STAP_A]);
    }

    #[test]
    fn picture_boundaries() {
        assert!(is_vcl(&[0x65, 0x88]));
        assert!(is_vcl(&[0x41, 0x9a]));
        assert!(!is_vcl(&[0x67, 0x42]));
        assert!(starts_picture(&[0x65, 0x88]));
        assert!(!starts_picture(&[0x41, 0x1a]));
        assert!(!starts_picture(&[0x68, 0xce]));
        assert!(is_unit_prefix(&[0x67, 0x42]));
        assert!(is_unit_prefix(&[0x09, 0xf0]));
        assert!(!is_unit_prefix(&[0x0c, 0xff]));
    }
}
