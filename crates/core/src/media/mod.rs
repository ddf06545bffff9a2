//! Media codecs, NAL extraction and RTP packetization.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded access unit is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping), one per emitted packet.
//! - **Timestamp** (32-bit), derived from the encoder PTS by
//!   [`rtp::rtp_timestamp`] and shared by every packet of an access unit.
//! - **SSRC** (32-bit), randomly chosen per session.
//! - **Marker bit**, set on the last packet of an access unit.
//!
//! ## Payload formats
//!
//! | Codec | Module | RFC | Single NAL | Aggregation | Fragmentation |
//! |-------|--------|-----|------------|-------------|---------------|
//! | H.264 | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | yes | STAP-A (24) | FU-A (28) |
//! | H.265 | [`h265`] | [RFC 7798](https://tools.ietf.org/html/rfc7798) | yes | AP (48) | FU (49) |
//!
//! MJPEG and JPEG channels can only be written to files.

pub mod h264;
pub mod h265;
pub mod nal;
pub mod rtp;

use std::fmt;
use std::str::FromStr;

use crate::error::StreamError;

/// Bitstream format produced by an encoder channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    Mjpeg,
    /// Still-image snapshots; every access unit is a separate picture.
    Jpeg,
}

impl Codec {
    /// Elementary-stream file extension, without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Mjpeg => "mjp",
            Self::Jpeg => "jpg",
        }
    }

    /// Whether each access unit is a self-contained picture file.
    pub fn is_still_image(self) -> bool {
        matches!(self, Self::Jpeg)
    }

    /// Locally assigned RTP payload type, `None` if the codec cannot be
    /// streamed over RTP.
    pub fn payload_type(self) -> Option<u8> {
        match self {
            Self::H264 => Some(96),
            Self::H265 => Some(97),
            Self::Mjpeg | Self::Jpeg => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "H.264"),
            Self::H265 => write!(f, "H.265"),
            Self::Mjpeg => write!(f, "MJPEG"),
            Self::Jpeg => write!(f, "JPEG"),
        }
    }
}

impl FromStr for Codec {
    type Err = StreamError;

    /// Accepts `264`/`h264`/`avc`, `265`/`h265`/`hevc`, `mjpeg`, `jpeg`/`jpg`
    /// in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower.contains("264") || lower == "avc" {
            Ok(Self::H264)
        } else if lower.contains("265") || lower == "hevc" {
            Ok(Self::H265)
        } else if lower == "mjpeg" || lower == "mjp" {
            Ok(Self::Mjpeg)
        } else if lower == "jpeg" || lower == "jpg" {
            Ok(Self::Jpeg)
        } else {
            Err(StreamError::InvalidConfig(format!("unknown codec: {s}")))
        }
    }
}

/// Codec-specific RTP payload headers for NAL-based codecs.
///
/// The generic decisions (single NAL vs. aggregation vs. fragmentation,
/// chunk sizes, marker bit) live in [`crate::session::RtpSession`];
/// implementors only know how their codec spells the payload headers.
pub trait NalPayloader: Send {
    fn codec(&self) -> Codec;

    /// Size of the codec's NAL unit header (1 for H.264, 2 for H.265).
    fn nal_header_len(&self) -> usize;

    /// Bytes written by [`fragment_prefix`](Self::fragment_prefix).
    fn fragment_prefix_len(&self) -> usize;

    /// Append the fragmentation-unit indicator and header for one fragment
    /// of `nal`. `start`/`end` become the S and E bits.
    fn fragment_prefix(&self, nal: &[u8], start: bool, end: bool, out: &mut Vec<u8>);

    /// Bytes written by [`aggregation_header`](Self::aggregation_header).
    fn aggregation_header_len(&self) -> usize;

    /// Append the aggregation-packet payload header covering `nals`.
    fn aggregation_header(&self, nals: &[&[u8]], out: &mut Vec<u8>);
}

/// Builds the RTP packets of one access unit.
///
/// The dispatcher holds one packetizer per RTP channel and is its only
/// user, so implementors need no internal locking.
pub trait Packetizer: Send {
    /// Packetize the NAL units of one access unit.
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet: 12-byte header
    /// (RFC 3550 §5.1) followed by the payload. `timestamp` is written to
    /// every packet.
    fn packetize(&mut self, nals: &[&[u8]], timestamp: u32) -> Vec<Vec<u8>>;

    fn codec(&self) -> Codec;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    fn payload_type(&self) -> u8;

    fn ssrc(&self) -> u32;

    /// Sequence number the next packet will carry.
    fn next_sequence(&self) -> u16;
}
