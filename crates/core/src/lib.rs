pub mod config;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod media;
pub mod session;
pub mod stats;
pub mod streamer;
pub mod transport;

pub use config::{ChannelConfig, OutputMode, StreamConfig};
pub use dispatch::Dispatcher;
pub use encoder::{AccessUnit, ChannelId, Encoder, Multiplexer, Pack, ReadyHandle};
pub use error::{ErrorClass, Result, StreamError};
pub use media::{Codec, Packetizer};
pub use session::RtpSession;
pub use stats::DispatchStats;
pub use streamer::Streamer;
pub use transport::{FileSink, PacketSink, UdpSink};
