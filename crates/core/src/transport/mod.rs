//! Output sinks for dispatched access units.
//!
//! - **UDP** ([`udp`]): RTP packets to a single remote receiver, one
//!   ephemeral socket per pipeline.
//!
//! - **File** ([`file`]): raw elementary stream, one file per channel (or
//!   one file per picture for still-image codecs).
//!
//! Packet-oriented sinks implement [`PacketSink`] so the dispatch loop can
//! be driven against an in-memory sink in tests.

pub mod file;
pub mod udp;

use crate::error::Result;

pub use file::FileSink;
pub use udp::UdpSink;

/// Destination for complete RTP packets.
pub trait PacketSink: Send {
    /// Send one packet. Returns the number of bytes sent.
    fn send_packet(&mut self, packet: &[u8]) -> Result<usize>;
}
