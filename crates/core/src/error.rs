//! Error types for the streaming pipeline.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::encoder::ChannelId;
use crate::media::Codec;

/// Errors that can occur anywhere in the pipeline.
///
/// Every variant belongs to one [`ErrorClass`], which decides how the
/// dispatch loop reacts to it:
///
/// - **Configuration**: invalid destination, failed probe, unsupported
///   codec/output combination. Raised before the worker starts.
/// - **Transient**: a single fetch, release or send failed. Logged, the
///   channel's cycle is abandoned, the loop keeps going.
/// - **ResourceExhaustion**: descriptor capacity or pack allocation. Ends
///   the loop.
/// - **Fatal**: the readiness wait itself failed. Ends the loop.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configured destination cannot receive datagrams.
    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    /// The startup probe datagram could not be sent in full.
    #[error("reachability probe to {addr} failed (sent {sent} of 1 bytes)")]
    ProbeFailed { addr: SocketAddr, sent: usize },

    /// An RTP channel was configured but no destination was given.
    #[error("RTP output requires a destination address")]
    MissingDestination,

    /// The codec cannot be carried by the requested output.
    #[error("codec {codec} is not supported for {output} output")]
    UnsupportedCodec { codec: Codec, output: &'static str },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A channel id was registered twice.
    #[error("channel {0} registered more than once")]
    DuplicateChannel(ChannelId),

    /// A channel was configured but never registered for readiness.
    #[error("channel {0} has no readiness handle")]
    UnknownChannel(ChannelId),

    /// More channels than the readiness set can watch.
    #[error("too many channels (limit {limit})")]
    TooManyChannels { limit: usize },

    /// The pack-descriptor vector for an access unit could not be allocated.
    #[error("cannot allocate {packs} pack descriptors for channel {channel}")]
    PackAllocation { channel: ChannelId, packs: usize },

    /// Every readiness producer is gone; waiting can never succeed.
    #[error("readiness set closed")]
    ReadinessClosed,

    /// The encoder rejected a query, fetch or release.
    #[error("encoder error on channel {channel}: {reason}")]
    Encoder { channel: ChannelId, reason: String },

    /// A datagram went out truncated.
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    /// Some packets of an access unit were not delivered.
    #[error("{failed} of {total} RTP packets failed to send")]
    PartialSend { failed: usize, total: usize },

    /// A replay input could not be turned into access units.
    #[error("no access units found in {}", path.display())]
    EmptyInput { path: PathBuf },

    /// [`Streamer::start`](crate::Streamer::start) was called twice.
    #[error("streamer already running")]
    AlreadyRunning,

    /// [`Streamer::join`](crate::Streamer::join) without a running worker.
    #[error("streamer not started")]
    NotStarted,

    /// The worker thread panicked.
    #[error("dispatch worker panicked")]
    WorkerPanicked,
}

/// How the pipeline reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Transient,
    ResourceExhaustion,
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Transient => write!(f, "transient"),
            Self::ResourceExhaustion => write!(f, "resource exhaustion"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

impl StreamError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidDestination(_)
            | Self::ProbeFailed { .. }
            | Self::MissingDestination
            | Self::UnsupportedCodec { .. }
            | Self::InvalidConfig(_)
            | Self::DuplicateChannel(_)
            | Self::UnknownChannel(_)
            | Self::EmptyInput { .. }
            | Self::AlreadyRunning
            | Self::NotStarted => ErrorClass::Configuration,
            Self::Io(_)
            | Self::Encoder { .. }
            | Self::ShortWrite { .. }
            | Self::PartialSend { .. } => ErrorClass::Transient,
            Self::TooManyChannels { .. } | Self::PackAllocation { .. } => {
                ErrorClass::ResourceExhaustion
            }
            Self::ReadinessClosed | Self::WorkerPanicked => ErrorClass::Fatal,
        }
    }

    /// Whether this error ends the dispatch loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ResourceExhaustion | ErrorClass::Fatal
        )
    }

    pub(crate) fn encoder(channel: ChannelId, reason: impl Into<String>) -> Self {
        Self::Encoder {
            channel,
            reason: reason.into(),
        }
    }
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
