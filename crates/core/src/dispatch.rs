//! The readiness-driven dispatch loop.
//!
//! One [`Dispatcher`] serves every configured channel from a single
//! thread. Each cycle waits on the [`Multiplexer`], then for every ready
//! channel:
//!
//! ```text
//! pending_packs ─► allocate descriptors ─► fetch ─► dispatch ─► release
//!      0 ─► skip          err ─► stop loop    err ─► skip   (always, once)
//! ```
//!
//! Dispatch is either RTP (NAL extraction, packetization, UDP) or a raw
//! file write. Failures of one channel never stop the others; only a
//! failed wait or a failed descriptor allocation ends the loop.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{ChannelConfig, OutputMode, StreamConfig};
use crate::encoder::{AccessUnit, Acquired, ChannelId, Encoder, Multiplexer};
use crate::error::{Result, StreamError};
use crate::media::nal::NalUnits;
use crate::media::rtp::rtp_timestamp;
use crate::media::{Codec, Packetizer};
use crate::session::RtpSession;
use crate::stats::DispatchStats;
use crate::transport::{FileSink, PacketSink, UdpSink};

enum Output {
    File(FileSink),
    Rtp(RtpSession),
}

struct Route {
    id: ChannelId,
    codec: Codec,
    output: Output,
    /// Access units dispatched so far.
    units: u64,
}

/// Outcome of sending one access unit over RTP.
#[derive(Debug, Default)]
struct RtpDelivery {
    total: u64,
    sent: u64,
    bytes: u64,
}

impl RtpDelivery {
    fn failed(&self) -> u64 {
        self.total - self.sent
    }
}

/// Pulls access units from an [`Encoder`] and routes them to their outputs.
pub struct Dispatcher<E: Encoder, S: PacketSink = UdpSink> {
    config: StreamConfig,
    encoder: E,
    mux: Multiplexer,
    routes: Vec<Route>,
    sink: Option<S>,
    stats: DispatchStats,
}

impl<E: Encoder> Dispatcher<E, UdpSink> {
    /// Validate the configuration and open every output.
    ///
    /// The UDP sink is only created (and the destination probed) when at
    /// least one channel streams over RTP.
    pub fn open(
        config: StreamConfig,
        channels: &[ChannelConfig],
        encoder: E,
        mux: Multiplexer,
    ) -> Result<Self> {
        let sink = if channels.iter().any(|c| c.output == OutputMode::Rtp) {
            let dest = config.destination.ok_or(StreamError::MissingDestination)?;
            Some(UdpSink::connect(dest)?)
        } else {
            None
        };

        Self::with_sink(config, channels, encoder, mux, sink)
    }
}

impl<E: Encoder, S: PacketSink> Dispatcher<E, S> {
    /// Like [`Dispatcher::open`], with a caller-provided packet sink.
    pub fn with_sink(
        config: StreamConfig,
        channels: &[ChannelConfig],
        encoder: E,
        mux: Multiplexer,
        sink: Option<S>,
    ) -> Result<Self> {
        config.validate()?;
        config.validate_channels(channels)?;

        let uses_rtp = channels.iter().any(|c| c.output == OutputMode::Rtp);
        if uses_rtp && sink.is_none() {
            return Err(StreamError::MissingDestination);
        }

        let mut routes = Vec::with_capacity(channels.len());
        for channel in channels {
            if !mux.is_registered(channel.id) {
                return Err(StreamError::UnknownChannel(channel.id));
            }
            let output = match channel.output {
                OutputMode::File => {
                    Output::File(FileSink::open(&config.output_dir, channel.id, channel.codec)?)
                }
                OutputMode::Rtp => {
                    Output::Rtp(RtpSession::new(channel.codec, &config.session_config())?)
                }
            };
            routes.push(Route {
                id: channel.id,
                codec: channel.codec,
                output,
                units: 0,
            });
        }

        tracing::info!(
            channels = routes.len(),
            destination = ?config.destination,
            frame_rate = config.frame_rate,
            aggregation = config.aggregation,
            payload_budget = config.payload_budget,
            "dispatcher ready"
        );

        Ok(Self {
            config,
            encoder,
            mux,
            routes,
            sink: if uses_rtp { sink } else { None },
            stats: DispatchStats::default(),
        })
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Run until `running` is cleared or a fatal error occurs.
    ///
    /// `running` is checked once per wait cycle. Every file sink is closed
    /// before this returns, whatever the outcome.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        tracing::info!(channels = self.routes.len(), "dispatch loop started");
        let result = self.run_loop(running);
        self.close_outputs();

        match &result {
            Ok(()) => tracing::info!(
                units = self.stats.units_fetched,
                packets = self.stats.rtp_packets,
                "dispatch loop stopped"
            ),
            Err(e) => tracing::error!(error = %e, class = %e.class(), "dispatch loop failed"),
        }
        result
    }

    fn run_loop(&mut self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::Acquire) {
            let ready = self.mux.wait(self.config.wait_timeout)?;
            self.stats.cycles += 1;

            if ready.is_empty() {
                self.stats.timeouts += 1;
                tracing::trace!("readiness wait timed out");
                continue;
            }

            for channel in ready {
                match self.service(channel) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(%channel, error = %e, class = %e.class(), "channel cycle failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// One acquire/dispatch/release cycle for a ready channel.
    fn service(&mut self, channel: ChannelId) -> Result<()> {
        let Some(index) = self.routes.iter().position(|r| r.id == channel) else {
            tracing::warn!(%channel, "readiness reported for an unconfigured channel");
            return Ok(());
        };

        let pending = match self.encoder.pending_packs(channel) {
            Ok(n) => n,
            Err(e) => {
                self.stats.fetch_errors += 1;
                return Err(e);
            }
        };
        if pending == 0 {
            self.stats.empty_wakeups += 1;
            tracing::debug!(%channel, "channel ready with no pending packs");
            return Ok(());
        }

        let unit = AccessUnit::try_with_capacity(channel, pending)?;

        let release_errors = self.stats.release_errors;
        let acquired = match Acquired::fetch(
            &mut self.encoder,
            unit,
            Some(&mut self.stats.release_errors),
        ) {
            Ok(acquired) => acquired,
            Err(e) => {
                self.stats.fetch_errors += 1;
                return Err(e);
            }
        };
        self.stats.units_fetched += 1;

        let route = &mut self.routes[index];
        route.units += 1;
        let unit = acquired.unit();
        let outcome = match &mut route.output {
            Output::File(file) => file.write_unit(unit).map(|(writes, bytes)| {
                self.stats.file_writes += writes;
                self.stats.file_bytes += bytes;
            }),
            Output::Rtp(session) => {
                let delivery = match self.sink.as_mut() {
                    Some(sink) => send_unit(session, sink, unit, route.units, self.config.log_interval()),
                    None => Err(StreamError::MissingDestination),
                };
                delivery.and_then(|d| {
                    self.stats.rtp_packets += d.sent;
                    self.stats.rtp_bytes += d.bytes;
                    self.stats.send_errors += d.failed();
                    if d.failed() > 0 {
                        return Err(StreamError::PartialSend {
                            failed: d.failed() as usize,
                            total: d.total as usize,
                        });
                    }
                    Ok(())
                })
            }
        };
        tracing::debug!(
            %channel,
            codec = %route.codec,
            packs = unit.packs().len(),
            bytes = unit.payload_len(),
            "access unit dispatched"
        );
        drop(acquired);

        if self.stats.release_errors == release_errors {
            self.stats.units_released += 1;
        }
        if outcome.is_err() {
            self.stats.dispatch_errors += 1;
        }
        outcome
    }

    fn close_outputs(&mut self) {
        for route in &mut self.routes {
            if let Output::File(file) = &mut route.output
                && let Err(e) = file.close()
            {
                tracing::warn!(channel = %route.id, error = %e, "failed to close file sink");
            }
        }
    }
}

/// Extract the NAL units of every pack, packetize them as one access unit
/// and send every packet, continuing past failed sends.
fn send_unit<S: PacketSink>(
    session: &mut RtpSession,
    sink: &mut S,
    unit: &AccessUnit,
    sequence: u64,
    log_interval: u64,
) -> Result<RtpDelivery> {
    let nals: Vec<&[u8]> = unit
        .packs()
        .iter()
        .flat_map(|pack| NalUnits::new(pack.payload()))
        .map(|nal| nal.bytes())
        .collect();

    let pts_us = unit.pts_us().unwrap_or(0);
    let timestamp = rtp_timestamp(pts_us);
    if sequence % log_interval == 0 {
        tracing::debug!(channel = %unit.channel(), pts_us, ts = timestamp, "timestamp mapping");
    }

    let packets = session.packetize(&nals, timestamp);
    if packets.is_empty() {
        tracing::debug!(channel = %unit.channel(), "access unit holds no NAL units");
    }

    let mut delivery = RtpDelivery {
        total: packets.len() as u64,
        ..Default::default()
    };
    let mut first_error = None;
    for packet in &packets {
        match sink.send_packet(packet) {
            Ok(n) => {
                delivery.sent += 1;
                delivery.bytes += n as u64;
            }
            Err(e) => {
                tracing::trace!(channel = %unit.channel(), error = %e, "RTP send failed");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        tracing::warn!(
            channel = %unit.channel(),
            error = %e,
            failed = delivery.failed(),
            total = delivery.total,
            "RTP packets dropped"
        );
    }
    Ok(delivery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Pack, ReadyHandle};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    /// Scripted encoder: each channel holds a queue of units.
    #[derive(Default)]
    struct ScriptedEncoder {
        units: Vec<(ChannelId, VecDeque<Vec<Pack>>)>,
        /// Reported instead of the real pending count when set.
        pending_override: Option<usize>,
        fail_fetch: bool,
        fetches: usize,
        releases: usize,
    }

    impl ScriptedEncoder {
        fn queue(&mut self, channel: ChannelId) -> &mut VecDeque<Vec<Pack>> {
            if let Some(i) = self.units.iter().position(|(id, _)| *id == channel) {
                return &mut self.units[i].1;
            }
            self.units.push((channel, VecDeque::new()));
            &mut self.units.last_mut().unwrap().1
        }
    }

    impl Encoder for ScriptedEncoder {
        fn pending_packs(&mut self, channel: ChannelId) -> Result<usize> {
            if let Some(n) = self.pending_override {
                return Ok(n);
            }
            Ok(self.queue(channel).front().map_or(0, Vec::len))
        }

        fn fetch(&mut self, channel: ChannelId, unit: &mut AccessUnit) -> Result<()> {
            if self.fail_fetch {
                return Err(StreamError::encoder(channel, "scripted failure"));
            }
            let packs = self.queue(channel).pop_front().unwrap();
            for pack in packs {
                unit.push(pack);
            }
            self.fetches += 1;
            Ok(())
        }

        fn release(&mut self, _channel: ChannelId, _unit: &AccessUnit) -> Result<()> {
            self.releases += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        packets: Vec<Vec<u8>>,
        fail_every: Option<usize>,
        calls: usize,
    }

    impl PacketSink for RecordingSink {
        fn send_packet(&mut self, packet: &[u8]) -> Result<usize> {
            self.calls += 1;
            if self.fail_every.is_some_and(|n| self.calls % n == 0) {
                return Err(StreamError::ShortWrite {
                    sent: 0,
                    expected: packet.len(),
                });
            }
            self.packets.push(packet.to_vec());
            Ok(packet.len())
        }
    }

    fn h264_unit(pts_us: u64) -> Vec<Pack> {
        vec![
            Pack::new(Bytes::from_static(&[0, 0, 0, 1, 0x67, 0x42, 0, 0x1e]), pts_us),
            Pack::new(Bytes::from_static(&[0, 0, 0, 1, 0x68, 0xce, 0x38]), pts_us),
            Pack::new(Bytes::from_static(&[0, 0, 1, 0x65, 0x88, 0x84, 0x21]), pts_us),
        ]
    }

    fn rtp_config() -> StreamConfig {
        StreamConfig {
            destination: Some("127.0.0.1:5004".parse().unwrap()),
            wait_timeout: Duration::from_millis(20),
            ..StreamConfig::default()
        }
    }

    fn setup(
        config: StreamConfig,
        channels: &[ChannelConfig],
        encoder: ScriptedEncoder,
        sink: RecordingSink,
    ) -> (Dispatcher<ScriptedEncoder, RecordingSink>, Vec<ReadyHandle>) {
        let mux = Multiplexer::new();
        let handles = channels.iter().map(|c| mux.register(c.id).unwrap()).collect();
        let dispatcher = Dispatcher::with_sink(config, channels, encoder, mux, Some(sink)).unwrap();
        (dispatcher, handles)
    }

    /// Run until the readiness set drains, then stop from the wait timeout.
    fn run_briefly(dispatcher: &mut Dispatcher<ScriptedEncoder, RecordingSink>) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let stopper = {
            let running = running.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                running.store(false, Ordering::Release);
            })
        };
        let result = dispatcher.run(&running);
        stopper.join().unwrap();
        result
    }

    #[test]
    fn dispatches_rtp_with_shared_timestamp() {
        let mut encoder = ScriptedEncoder::default();
        encoder.queue(ChannelId(0)).push_back(h264_unit(33_333));
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        let mut config = rtp_config();
        config.aggregation = false;
        let (mut dispatcher, handles) = setup(config, &channels, encoder, RecordingSink::default());

        handles[0].notify();
        run_briefly(&mut dispatcher).unwrap();

        let packets = &dispatcher.sink.as_ref().unwrap().packets;
        assert_eq!(packets.len(), 3);
        for p in packets {
            assert_eq!(u32::from_be_bytes([p[4], p[5], p[6], p[7]]), 2997);
        }
        assert_eq!(packets.iter().filter(|p| p[1] & 0x80 != 0).count(), 1);
        assert!(packets[2][1] & 0x80 != 0);

        let stats = dispatcher.stats();
        assert_eq!(stats.units_fetched, 1);
        assert_eq!(stats.units_released, 1);
        assert_eq!(stats.rtp_packets, 3);
        assert_eq!(dispatcher.encoder().releases, 1);
    }

    #[test]
    fn timeout_cycle_touches_nothing() {
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        let (mut dispatcher, _handles) =
            setup(rtp_config(), &channels, ScriptedEncoder::default(), RecordingSink::default());

        run_briefly(&mut dispatcher).unwrap();

        let stats = dispatcher.stats();
        assert!(stats.timeouts > 0);
        assert_eq!(stats.timeouts, stats.cycles);
        assert_eq!(dispatcher.encoder().fetches, 0);
        assert_eq!(dispatcher.encoder().releases, 0);
    }

    #[test]
    fn empty_wakeup_is_skipped() {
        let channels = [ChannelConfig::new(3, Codec::H265, OutputMode::Rtp)];
        let (mut dispatcher, handles) =
            setup(rtp_config(), &channels, ScriptedEncoder::default(), RecordingSink::default());
        handles[0].notify();
        run_briefly(&mut dispatcher).unwrap();
        assert_eq!(dispatcher.stats().empty_wakeups, 1);
        assert_eq!(dispatcher.encoder().fetches, 0);
    }

    #[test]
    fn failed_fetch_is_not_released_and_loop_continues() {
        let mut encoder = ScriptedEncoder {
            fail_fetch: true,
            ..Default::default()
        };
        encoder.queue(ChannelId(0)).push_back(h264_unit(0));
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        let (mut dispatcher, handles) = setup(rtp_config(), &channels, encoder, RecordingSink::default());
        handles[0].notify();
        handles[0].notify();

        run_briefly(&mut dispatcher).unwrap();

        assert_eq!(dispatcher.stats().fetch_errors, 2);
        assert_eq!(dispatcher.encoder().releases, 0);
    }

    #[test]
    fn partial_send_still_releases() {
        let mut encoder = ScriptedEncoder::default();
        encoder.queue(ChannelId(0)).push_back(h264_unit(0));
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        let mut config = rtp_config();
        config.aggregation = false;
        let sink = RecordingSink {
            fail_every: Some(2),
            ..Default::default()
        };
        let (mut dispatcher, handles) = setup(config, &channels, encoder, sink);
        handles[0].notify();

        run_briefly(&mut dispatcher).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.rtp_packets, 2);
        assert_eq!(stats.dispatch_errors, 1);
        assert_eq!(stats.units_released, 1);
        assert_eq!(dispatcher.encoder().releases, 1);
        // the failed packet still consumed its sequence number
        let packets = &dispatcher.sink.as_ref().unwrap().packets;
        assert_eq!(u16::from_be_bytes([packets[0][2], packets[0][3]]), 0);
        assert_eq!(u16::from_be_bytes([packets[1][2], packets[1][3]]), 2);
    }

    #[test]
    fn file_and_rtp_channels_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = ScriptedEncoder::default();
        encoder.queue(ChannelId(0)).push_back(h264_unit(0));
        encoder
            .queue(ChannelId(1))
            .push_back(vec![Pack::new(Bytes::from_static(&[0xFF, 0xD8, 7, 0xFF, 0xD9]), 0)]);
        let channels = [
            ChannelConfig::new(0, Codec::H264, OutputMode::Rtp),
            ChannelConfig::new(1, Codec::Jpeg, OutputMode::File),
        ];
        let config = StreamConfig {
            output_dir: dir.path().to_path_buf(),
            ..rtp_config()
        };
        let (mut dispatcher, handles) = setup(config, &channels, encoder, RecordingSink::default());
        handles[1].notify();
        handles[0].notify();

        run_briefly(&mut dispatcher).unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.units_fetched, 2);
        assert_eq!(stats.rtp_packets, 1);
        assert_eq!(stats.file_writes, 1);
        assert_eq!(
            std::fs::read(dir.path().join("stream_chn1_0.jpg")).unwrap(),
            vec![0xFF, 0xD8, 7, 0xFF, 0xD9]
        );
    }

    #[test]
    fn closed_readiness_ends_loop_and_closes_files() {
        let dir = tempfile::tempdir().unwrap();
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::File)];
        let config = StreamConfig {
            output_dir: dir.path().to_path_buf(),
            ..rtp_config()
        };
        let (mut dispatcher, handles) =
            setup(config, &channels, ScriptedEncoder::default(), RecordingSink::default());
        drop(handles);

        let err = run_briefly(&mut dispatcher).unwrap_err();
        assert!(matches!(err, StreamError::ReadinessClosed));
        assert!(dispatcher.routes.iter().all(|r| match &r.output {
            Output::File(f) => f.is_closed(),
            Output::Rtp(_) => true,
        }));
    }

    #[test]
    fn allocation_failure_ends_loop_and_closes_files() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = ScriptedEncoder {
            pending_override: Some(usize::MAX),
            ..Default::default()
        };
        let channels = [ChannelConfig::new(2, Codec::H265, OutputMode::File)];
        let config = StreamConfig {
            output_dir: dir.path().to_path_buf(),
            ..rtp_config()
        };
        let (mut dispatcher, handles) = setup(config, &channels, encoder, RecordingSink::default());
        handles[0].notify();
        handles[0].notify();

        let err = run_briefly(&mut dispatcher).unwrap_err();

        assert!(matches!(
            err,
            StreamError::PackAllocation {
                channel: ChannelId(2),
                packs: usize::MAX
            }
        ));
        assert_eq!(dispatcher.stats().cycles, 1);
        assert_eq!(dispatcher.encoder().fetches, 0);
        assert_eq!(dispatcher.encoder().releases, 0);
        assert!(dispatcher.routes.iter().all(|r| match &r.output {
            Output::File(f) => f.is_closed(),
            Output::Rtp(_) => true,
        }));
    }

    #[test]
    fn construction_checks() {
        let channels = [ChannelConfig::new(0, Codec::H264, OutputMode::Rtp)];
        let mux = Multiplexer::new();
        let err = Dispatcher::<_, RecordingSink>::with_sink(
            rtp_config(),
            &channels,
            ScriptedEncoder::default(),
            mux,
            None,
        );
        assert!(matches!(err, Err(StreamError::MissingDestination)));

        let unregistered = Dispatcher::with_sink(
            rtp_config(),
            &channels,
            ScriptedEncoder::default(),
            Multiplexer::new(),
            Some(RecordingSink::default()),
        );
        assert!(matches!(unregistered, Err(StreamError::UnknownChannel(ChannelId(0)))));

        let no_dest = Dispatcher::open(
            StreamConfig::default(),
            &channels,
            ScriptedEncoder::default(),
            Multiplexer::new(),
        );
        assert!(matches!(no_dest, Err(StreamError::MissingDestination)));

        let file_only = [ChannelConfig::new(0, Codec::H264, OutputMode::File)];
        let bad_rate = Dispatcher::open(
            StreamConfig {
                frame_rate: 0,
                ..StreamConfig::default()
            },
            &file_only,
            ScriptedEncoder::default(),
            Multiplexer::new(),
        );
        assert!(matches!(bad_rate, Err(StreamError::InvalidConfig(_))));

        let no_channels = Dispatcher::open(
            StreamConfig::default(),
            &[],
            ScriptedEncoder::default(),
            Multiplexer::new(),
        );
        assert!(matches!(no_channels, Err(StreamError::InvalidConfig(_))));
    }
}
