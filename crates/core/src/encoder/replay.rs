//! Software encoder that replays elementary-stream files.
//!
//! Each [`ReplayChannel`] splits its input into access units once, up
//! front, and a producer thread publishes one unit every `1 / fps`
//! seconds, the way a hardware channel finishes frames. Packs point into
//! the file buffer, so nothing is copied after loading.
//!
//! Access-unit boundaries for H.264/H.265 are found from NAL types: a new
//! unit starts at a parameter set, SEI or delimiter that follows a slice,
//! or at a slice that begins a new picture. MJPEG/JPEG inputs are split at
//! SOI..EOI markers.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{AccessUnit, ChannelId, Encoder, Pack, ReadyHandle};
use crate::error::{Result, StreamError};
use crate::media::nal::NalUnits;
use crate::media::{Codec, h264, h265};

/// Finished units kept per channel before the oldest is overwritten.
pub const QUEUE_DEPTH: usize = 8;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Split an elementary stream into access units, each a list of pack
/// buffers sliced from `data`.
pub fn split_access_units(data: &Bytes, codec: Codec) -> Vec<Vec<Bytes>> {
    match codec {
        Codec::H264 | Codec::H265 => split_nal_stream(data, codec),
        Codec::Mjpeg | Codec::Jpeg => split_jpeg_stream(data),
    }
}

type NalClass = fn(&[u8]) -> bool;

fn split_nal_stream(data: &Bytes, codec: Codec) -> Vec<Vec<Bytes>> {
    let (is_vcl, is_prefix, starts_picture): (NalClass, NalClass, NalClass) = match codec {
        Codec::H265 => (h265::is_vcl, h265::is_unit_prefix, h265::starts_picture),
        _ => (h264::is_vcl, h264::is_unit_prefix, h264::starts_picture),
    };

    let mut units = Vec::new();
    let mut current: Vec<Bytes> = Vec::new();
    let mut has_slice = false;

    for nal in NalUnits::new(data) {
        let bytes = nal.bytes();
        if has_slice && (is_prefix(bytes) || starts_picture(bytes)) {
            units.push(std::mem::take(&mut current));
            has_slice = false;
        }
        current.push(data.slice(nal.range_with_prefix()));
        has_slice |= is_vcl(bytes);
    }
    if !current.is_empty() {
        units.push(current);
    }
    units
}

fn split_jpeg_stream(data: &Bytes) -> Vec<Vec<Bytes>> {
    let find = |from: usize, marker: [u8; 2]| {
        data.get(from..)
            .and_then(|rest| rest.windows(2).position(|w| w == marker))
            .map(|p| from + p)
    };

    let mut units = Vec::new();
    let mut pos = 0;
    while let Some(soi) = find(pos, JPEG_SOI) {
        let Some(eoi) = find(soi + 2, JPEG_EOI) else {
            break;
        };
        units.push(vec![data.slice(soi..eoi + 2)]);
        pos = eoi + 2;
    }
    units
}

#[derive(Debug, Default)]
struct Queue {
    units: VecDeque<Vec<Pack>>,
    outstanding: bool,
    overwritten: u64,
}

/// One replayed encoder channel.
pub struct ReplayChannel {
    id: ChannelId,
    codec: Codec,
    source: PathBuf,
    units: Vec<Vec<Bytes>>,
    fps: u32,
    looping: bool,
    ready: ReadyHandle,
}

impl ReplayChannel {
    /// Load `path` and split it into access units.
    pub fn open(
        path: impl AsRef<Path>,
        codec: Codec,
        fps: u32,
        looping: bool,
        ready: ReadyHandle,
    ) -> Result<Self> {
        let path = path.as_ref();
        let data = Bytes::from(std::fs::read(path)?);
        Self::from_bytes(data, path, codec, fps, looping, ready)
    }

    /// Build a channel from an in-memory stream; `source` is only used in
    /// logs and errors.
    pub fn from_bytes(
        data: Bytes,
        source: impl Into<PathBuf>,
        codec: Codec,
        fps: u32,
        looping: bool,
        ready: ReadyHandle,
    ) -> Result<Self> {
        let source = source.into();
        if fps == 0 {
            return Err(StreamError::InvalidConfig("frame rate must be positive".into()));
        }
        let units = split_access_units(&data, codec);
        if units.is_empty() {
            return Err(StreamError::EmptyInput { path: source });
        }

        tracing::info!(
            channel = %ready.channel(),
            %codec,
            source = %source.display(),
            units = units.len(),
            bytes = data.len(),
            "replay input loaded"
        );

        Ok(Self {
            id: ready.channel(),
            codec,
            source,
            units,
            fps,
            looping,
            ready,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Number of access units in one pass over the input.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn produce(self, queue: Arc<Mutex<Queue>>, stop: Arc<AtomicBool>) {
        let interval = Duration::from_micros(1_000_000 / u64::from(self.fps));
        let mut index = 0u64;
        let mut cursor = 0usize;
        let mut next = Instant::now();

        while !stop.load(Ordering::Acquire) {
            if cursor == self.units.len() {
                if !self.looping {
                    thread::sleep(interval);
                    continue;
                }
                tracing::debug!(channel = %self.id, source = %self.source.display(), "replay looping");
                cursor = 0;
            }

            let pts_us = index * 1_000_000 / u64::from(self.fps);
            let packs: Vec<Pack> = self.units[cursor]
                .iter()
                .map(|data| Pack::new(data.clone(), pts_us))
                .collect();

            {
                let mut q = queue.lock();
                if q.units.len() >= QUEUE_DEPTH {
                    q.units.pop_front();
                    q.overwritten += 1;
                    tracing::warn!(channel = %self.id, overwritten = q.overwritten, "stream buffer full, oldest unit dropped");
                }
                q.units.push_back(packs);
            }
            self.ready.notify();

            index += 1;
            cursor += 1;

            next += interval;
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            } else {
                next = now;
            }
        }

        tracing::debug!(channel = %self.id, produced = index, "replay producer stopped");
    }
}

struct ChannelSlot {
    id: ChannelId,
    queue: Arc<Mutex<Queue>>,
}

/// [`Encoder`] over a set of [`ReplayChannel`]s.
///
/// Producer threads start immediately and are stopped and joined when the
/// encoder is dropped.
pub struct ReplayEncoder {
    slots: Vec<ChannelSlot>,
    stop: Arc<AtomicBool>,
    producers: Vec<JoinHandle<()>>,
}

impl ReplayEncoder {
    pub fn start(channels: Vec<ReplayChannel>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut encoder = Self {
            slots: Vec::with_capacity(channels.len()),
            stop: stop.clone(),
            producers: Vec::with_capacity(channels.len()),
        };

        for channel in channels {
            let queue = Arc::new(Mutex::new(Queue::default()));
            encoder.slots.push(ChannelSlot {
                id: channel.id,
                queue: queue.clone(),
            });
            let stop = stop.clone();
            let handle = thread::Builder::new()
                .name(format!("venc-replay-{}", channel.id))
                .spawn(move || channel.produce(queue, stop))?;
            encoder.producers.push(handle);
        }

        Ok(encoder)
    }

    fn queue(&self, channel: ChannelId) -> Result<&Arc<Mutex<Queue>>> {
        self.slots
            .iter()
            .find(|s| s.id == channel)
            .map(|s| &s.queue)
            .ok_or_else(|| StreamError::encoder(channel, "no such replay channel"))
    }
}

impl Encoder for ReplayEncoder {
    fn pending_packs(&mut self, channel: ChannelId) -> Result<usize> {
        let q = self.queue(channel)?.lock();
        Ok(q.units.front().map_or(0, Vec::len))
    }

    fn fetch(&mut self, channel: ChannelId, unit: &mut AccessUnit) -> Result<()> {
        let mut q = self.queue(channel)?.lock();
        if q.outstanding {
            return Err(StreamError::encoder(channel, "previous access unit not released"));
        }
        let Some(packs) = q.units.pop_front() else {
            return Err(StreamError::encoder(channel, "no access unit pending"));
        };
        if packs.len() > unit.capacity() {
            q.units.push_front(packs);
            return Err(StreamError::encoder(channel, "pack descriptor array too small"));
        }
        for pack in packs {
            unit.push(pack);
        }
        q.outstanding = true;
        Ok(())
    }

    fn release(&mut self, channel: ChannelId, _unit: &AccessUnit) -> Result<()> {
        let mut q = self.queue(channel)?.lock();
        if !q.outstanding {
            return Err(StreamError::encoder(channel, "release without fetch"));
        }
        q.outstanding = false;
        Ok(())
    }
}

impl Drop for ReplayEncoder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.producers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("replay producer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::Multiplexer;

    fn annexb(nals: &[&[u8]]) -> Bytes {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        Bytes::from(out)
    }

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e];
    const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84];
    const P_SLICE: &[u8] = &[0x41, 0x9a, 0x22];
    const P_SLICE_2ND: &[u8] = &[0x41, 0x1a, 0x33];

    #[test]
    fn groups_h264_into_access_units() {
        let data = annexb(&[SPS, PPS, IDR, P_SLICE, P_SLICE_2ND, SPS, PPS, IDR]);
        let units = split_access_units(&data, Codec::H264);
        let sizes: Vec<usize> = units.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 2, 3]);
        // packs keep their start codes
        assert_eq!(&units[0][0][..], &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e]);
        let total: usize = units.iter().flatten().map(Bytes::len).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn groups_h265_into_access_units() {
        let vps: &[u8] = &[0x40, 0x01, 0x0c];
        let idr: &[u8] = &[0x26, 0x01, 0xaf];
        let trail: &[u8] = &[0x02, 0x01, 0xd0];
        let suffix_sei: &[u8] = &[0x50, 0x01, 0x05];
        let data = annexb(&[vps, idr, suffix_sei, trail, trail]);
        let sizes: Vec<usize> = split_access_units(&data, Codec::H265)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![3, 1, 1]);
    }

    #[test]
    fn splits_concatenated_jpegs() {
        let mut data = vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9];
        data.extend_from_slice(&[0x00, 0xFF, 0xD8, 3, 0xFF, 0xD9, 0xFF, 0xD8, 4]);
        let units = split_access_units(&Bytes::from(data), Codec::Jpeg);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[1][0][..], &[0xFF, 0xD8, 3, 0xFF, 0xD9]);
    }

    #[test]
    fn empty_input_is_rejected() {
        let mux = Multiplexer::new();
        let handle = mux.register(ChannelId(0)).unwrap();
        let err = ReplayChannel::from_bytes(Bytes::from_static(&[1, 2, 3]), "junk.h264", Codec::H264, 30, false, handle);
        assert!(matches!(err, Err(StreamError::EmptyInput { .. })));
    }

    #[test]
    fn produces_fetches_and_enforces_release() {
        let mux = Multiplexer::new();
        let handle = mux.register(ChannelId(1)).unwrap();
        let data = annexb(&[SPS, PPS, IDR, P_SLICE]);
        let channel = ReplayChannel::from_bytes(data, "mem", Codec::H264, 100, false, handle).unwrap();
        assert_eq!(channel.unit_count(), 2);
        let mut encoder = ReplayEncoder::start(vec![channel]).unwrap();

        assert_eq!(mux.wait(Duration::from_secs(2)).unwrap(), vec![ChannelId(1)]);
        let pending = encoder.pending_packs(ChannelId(1)).unwrap();
        assert_eq!(pending, 3);

        let mut unit = AccessUnit::try_with_capacity(ChannelId(1), pending).unwrap();
        encoder.fetch(ChannelId(1), &mut unit).unwrap();
        assert_eq!(unit.packs().len(), 3);
        assert_eq!(unit.pts_us(), Some(0));

        let mut second = AccessUnit::try_with_capacity(ChannelId(1), 4).unwrap();
        assert!(encoder.fetch(ChannelId(1), &mut second).is_err());

        encoder.release(ChannelId(1), &unit).unwrap();
        assert!(encoder.release(ChannelId(1), &unit).is_err());

        assert_eq!(mux.wait(Duration::from_secs(2)).unwrap(), vec![ChannelId(1)]);
        let mut unit = AccessUnit::try_with_capacity(ChannelId(1), 1).unwrap();
        encoder.fetch(ChannelId(1), &mut unit).unwrap();
        assert_eq!(unit.pts_us(), Some(10_000));
        encoder.release(ChannelId(1), &unit).unwrap();

        assert!(encoder.pending_packs(ChannelId(7)).is_err());
    }
}
