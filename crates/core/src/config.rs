use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::encoder::ChannelId;
use crate::encoder::readiness::MAX_CHANNELS;
use crate::error::{Result, StreamError};
use crate::media::Codec;
use crate::session::{DEFAULT_PAYLOAD_BUDGET, SessionConfig, check_payload_budget};

/// Highest frame rate the encoder channels are configured for.
pub const MAX_FRAME_RATE: u32 = 30;

/// Pipeline-level configuration shared by every channel.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Receiver for RTP channels. Required as soon as one channel uses
    /// [`OutputMode::Rtp`].
    pub destination: Option<SocketAddr>,
    /// Frames per second; also sets the period of the timestamp debug log.
    pub frame_rate: u32,
    /// Aggregate the NALs of an access unit (STAP-A / AP) when they fit.
    pub aggregation: bool,
    /// Maximum RTP payload size in bytes (header excluded).
    pub payload_budget: usize,
    /// Directory for file outputs.
    pub output_dir: PathBuf,
    /// Readiness wait timeout per dispatch cycle.
    pub wait_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            destination: None,
            frame_rate: MAX_FRAME_RATE,
            aggregation: true,
            payload_budget: DEFAULT_PAYLOAD_BUDGET,
            output_dir: PathBuf::from("."),
            wait_timeout: Duration::from_secs(2),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_rate == 0 || self.frame_rate > MAX_FRAME_RATE {
            return Err(StreamError::InvalidConfig(format!(
                "frame rate {} outside 1..={MAX_FRAME_RATE}",
                self.frame_rate
            )));
        }
        check_payload_budget(self.payload_budget)?;
        if self.wait_timeout.is_zero() {
            return Err(StreamError::InvalidConfig(
                "wait timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Check a channel set: count, unique ids, codecs the output can carry.
    pub fn validate_channels(&self, channels: &[ChannelConfig]) -> Result<()> {
        if channels.is_empty() {
            return Err(StreamError::InvalidConfig("no channels configured".into()));
        }
        if channels.len() > MAX_CHANNELS {
            return Err(StreamError::TooManyChannels {
                limit: MAX_CHANNELS,
            });
        }
        for (i, channel) in channels.iter().enumerate() {
            if channels[..i].iter().any(|c| c.id == channel.id) {
                return Err(StreamError::DuplicateChannel(channel.id));
            }
            if channel.output == OutputMode::Rtp && channel.codec.payload_type().is_none() {
                return Err(StreamError::UnsupportedCodec {
                    codec: channel.codec,
                    output: "RTP",
                });
            }
        }
        Ok(())
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            aggregation: self.aggregation,
            payload_budget: self.payload_budget,
            ssrc: None,
        }
    }

    /// Access units between two timestamp debug lines.
    pub(crate) fn log_interval(&self) -> u64 {
        u64::from(self.frame_rate.max(1)) * 10
    }
}

/// Where a channel's access units go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    File,
    Rtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub codec: Codec,
    pub output: OutputMode,
}

impl ChannelConfig {
    pub fn new(id: u32, codec: Codec, output: OutputMode) -> Self {
        Self {
            id: ChannelId(id),
            codec,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.frame_rate, 30);
        assert!(config.aggregation);
        assert_eq!(config.payload_budget, 1400);
        assert_eq!(config.log_interval(), 300);
    }

    #[test]
    fn frame_rate_range() {
        let mut config = StreamConfig::default();
        config.frame_rate = 0;
        assert!(config.validate().is_err());
        config.frame_rate = 31;
        assert!(config.validate().is_err());
        config.frame_rate = 1;
        config.validate().unwrap();
    }

    #[test]
    fn payload_budget_range() {
        use crate::session::{MAX_PAYLOAD_BUDGET, MIN_PAYLOAD_BUDGET};

        let mut config = StreamConfig::default();
        config.payload_budget = MIN_PAYLOAD_BUDGET - 1;
        assert!(config.validate().is_err());
        config.payload_budget = 100_000;
        assert!(matches!(config.validate(), Err(StreamError::InvalidConfig(_))));
        config.payload_budget = MAX_PAYLOAD_BUDGET;
        config.validate().unwrap();
    }

    #[test]
    fn channel_sets() {
        let config = StreamConfig::default();
        assert!(config.validate_channels(&[]).is_err());

        let h264 = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        config.validate_channels(&h264).unwrap();

        let jpeg = [ChannelConfig::new(0, Codec::Jpeg, OutputMode::Rtp)];
        assert!(matches!(
            config.validate_channels(&jpeg),
            Err(StreamError::UnsupportedCodec { .. })
        ));

        let files = [
            ChannelConfig::new(0, Codec::Mjpeg, OutputMode::File),
            ChannelConfig::new(0, Codec::Jpeg, OutputMode::File),
        ];
        assert!(matches!(
            config.validate_channels(&files),
            Err(StreamError::DuplicateChannel(ChannelId(0)))
        ));

        let many: Vec<_> = (0..17)
            .map(|i| ChannelConfig::new(i, Codec::H265, OutputMode::File))
            .collect();
        assert!(matches!(
            config.validate_channels(&many),
            Err(StreamError::TooManyChannels { limit: 16 })
        ));
    }
}
