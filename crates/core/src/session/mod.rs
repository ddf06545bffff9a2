//! Per-channel RTP session state and packetization.
//!
//! An [`RtpSession`] lives for the whole streaming session of one channel.
//! It owns:
//!
//! - the 16-bit sequence counter and SSRC ([`RtpHeader`]),
//! - the static payload type of the channel's codec,
//! - the aggregation flag and the payload budget,
//! - the codec's payload format ([`NalPayloader`]).
//!
//! ## Packetization rules
//!
//! ```text
//! aggregation on, >1 NAL, everything fits  -> 1 aggregation packet
//! otherwise, per NAL:   fits               -> 1 single-NAL packet
//!                       larger than budget -> N fragmentation units
//! ```
//!
//! The marker bit goes on the packet carrying the last byte of the access
//! unit. Sequence numbers advance once per packet.

use crate::error::{Result, StreamError};
use crate::media::h264::H264Payloader;
use crate::media::h265::H265Payloader;
use crate::media::rtp::{RTP_HEADER_LEN, RtpHeader, VIDEO_CLOCK_RATE};
use crate::media::{Codec, NalPayloader, Packetizer};

/// Default RTP payload budget in bytes (header excluded).
pub const DEFAULT_PAYLOAD_BUDGET: usize = 1400;

/// Smallest payload budget that still leaves room for fragment data.
pub const MIN_PAYLOAD_BUDGET: usize = 16;

/// Largest payload budget: a maximal IPv4 UDP datagram (65,507 bytes)
/// minus the RTP header.
pub const MAX_PAYLOAD_BUDGET: usize = 65_507 - RTP_HEADER_LEN;

/// Size prefix in front of every NAL inside an aggregation packet.
const AGGREGATION_LENGTH_LEN: usize = 2;

/// Reject payload budgets outside `MIN_PAYLOAD_BUDGET..=MAX_PAYLOAD_BUDGET`.
pub(crate) fn check_payload_budget(budget: usize) -> Result<()> {
    if !(MIN_PAYLOAD_BUDGET..=MAX_PAYLOAD_BUDGET).contains(&budget) {
        return Err(StreamError::InvalidConfig(format!(
            "payload budget {budget} outside {MIN_PAYLOAD_BUDGET}..={MAX_PAYLOAD_BUDGET}"
        )));
    }
    Ok(())
}

/// Static parameters of an [`RtpSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Pack NALs of one access unit into a single packet when they fit.
    pub aggregation: bool,
    /// Maximum RTP payload size in bytes.
    pub payload_budget: usize,
    /// Fixed SSRC; random when `None`.
    pub ssrc: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aggregation: true,
            payload_budget: DEFAULT_PAYLOAD_BUDGET,
            ssrc: None,
        }
    }
}

/// RTP state of one channel.
pub struct RtpSession {
    header: RtpHeader,
    payloader: Box<dyn NalPayloader>,
    aggregation: bool,
    payload_budget: usize,
}

impl RtpSession {
    pub fn new(codec: Codec, config: &SessionConfig) -> Result<Self> {
        let payloader: Box<dyn NalPayloader> = match codec {
            Codec::H264 => Box::new(H264Payloader),
            Codec::H265 => Box::new(H265Payloader),
            Codec::Mjpeg | Codec::Jpeg => {
                return Err(StreamError::UnsupportedCodec {
                    codec,
                    output: "RTP",
                });
            }
        };
        check_payload_budget(config.payload_budget)?;

        let pt = codec
            .payload_type()
            .ok_or(StreamError::UnsupportedCodec {
                codec,
                output: "RTP",
            })?;
        let header = match config.ssrc {
            Some(ssrc) => RtpHeader::new(pt, ssrc),
            None => RtpHeader::with_random_ssrc(pt),
        };

        Ok(Self {
            header,
            payloader,
            aggregation: config.aggregation,
            payload_budget: config.payload_budget,
        })
    }

    pub fn aggregation(&self) -> bool {
        self.aggregation
    }

    pub fn payload_budget(&self) -> usize {
        self.payload_budget
    }

    fn aggregated_size(&self, nals: &[&[u8]]) -> usize {
        self.payloader.aggregation_header_len()
            + nals
                .iter()
                .map(|n| AGGREGATION_LENGTH_LEN + n.len())
                .sum::<usize>()
    }

    fn push_aggregate(&mut self, nals: &[&[u8]], size: usize, packets: &mut Vec<Vec<u8>>) {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + size);
        packet.extend_from_slice(&self.header.write(true));
        self.payloader.aggregation_header(nals, &mut packet);
        for nal in nals {
            packet.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            packet.extend_from_slice(nal);
        }
        packets.push(packet);
    }

    fn push_single(&mut self, nal: &[u8], marker: bool, packets: &mut Vec<Vec<u8>>) {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + nal.len());
        packet.extend_from_slice(&self.header.write(marker));
        packet.extend_from_slice(nal);
        packets.push(packet);
    }

    fn push_fragments(&mut self, nal: &[u8], is_last_nal: bool, packets: &mut Vec<Vec<u8>>) {
        let prefix_len = self.payloader.fragment_prefix_len();
        let body = &nal[self.payloader.nal_header_len()..];
        let max_fragment = self.payload_budget - prefix_len;
        let before = packets.len();

        let mut offset = 0usize;
        while offset < body.len() {
            let remaining = body.len() - offset;
            let last_fragment = remaining <= max_fragment;
            let chunk = &body[offset..offset + remaining.min(max_fragment)];

            let mut packet = Vec::with_capacity(RTP_HEADER_LEN + prefix_len + chunk.len());
            packet.extend_from_slice(&self.header.write(is_last_nal && last_fragment));
            self.payloader
                .fragment_prefix(nal, offset == 0, last_fragment, &mut packet);
            packet.extend_from_slice(chunk);
            packets.push(packet);

            offset += chunk.len();
        }

        tracing::trace!(
            codec = %self.payloader.codec(),
            nal_size = nal.len(),
            fragments = packets.len() - before,
            "fragmented NAL unit"
        );
    }
}

impl Packetizer for RtpSession {
    fn packetize(&mut self, nals: &[&[u8]], timestamp: u32) -> Vec<Vec<u8>> {
        let nals: Vec<&[u8]> = nals.iter().copied().filter(|n| !n.is_empty()).collect();
        let mut packets = Vec::new();
        if nals.is_empty() {
            return packets;
        }

        self.header.set_timestamp(timestamp);

        // size prefixes are 16-bit
        let aggregated = self.aggregated_size(&nals);
        let prefixable = nals.iter().all(|n| n.len() <= usize::from(u16::MAX));
        if self.aggregation && nals.len() > 1 && prefixable && aggregated <= self.payload_budget {
            self.push_aggregate(&nals, aggregated, &mut packets);
        } else {
            let last = nals.len() - 1;
            for (i, nal) in nals.iter().enumerate() {
                if nal.len() <= self.payload_budget {
                    self.push_single(nal, i == last, &mut packets);
                } else {
                    self.push_fragments(nal, i == last, &mut packets);
                }
            }
        }

        tracing::trace!(
            nal_count = nals.len(),
            rtp_packets = packets.len(),
            seq = self.header.sequence(),
            ts = timestamp,
            "access unit packetized"
        );

        packets
    }

    fn codec(&self) -> Codec {
        self.payloader.codec()
    }

    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }
}
