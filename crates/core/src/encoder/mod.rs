//! The upstream encoder boundary.
//!
//! The hardware encoder owns a pool of stream buffers. For every finished
//! frame it exposes one access unit, made of one or more packs that point
//! into that pool. The pipeline borrows an access unit for one dispatch
//! cycle:
//!
//! ```text
//! readiness ──► pending_packs ──► fetch ──► dispatch ──► release
//!                    │ 0              │ err
//!                    └─ skip          └─ abandon cycle (no release)
//! ```
//!
//! Every successful [`Encoder::fetch`] is paired with exactly one
//! [`Encoder::release`]; [`Acquired`] enforces this by releasing on drop.

pub mod readiness;
pub mod replay;

use std::fmt;

use bytes::Bytes;

use crate::error::{Result, StreamError};

pub use readiness::{Multiplexer, ReadyHandle};
pub use replay::{ReplayChannel, ReplayEncoder};

/// Encoder channel number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One memory pack of an access unit.
///
/// `len` is measured from the start of `data`, like the encoder's own pack
/// descriptors: the payload is `data[offset..len]` and carries
/// `len - offset` bytes.
#[derive(Debug, Clone)]
pub struct Pack {
    pub data: Bytes,
    pub offset: usize,
    pub len: usize,
    /// Presentation timestamp in microseconds.
    pub pts_us: u64,
}

impl Pack {
    /// A pack whose payload is all of `data`.
    pub fn new(data: Bytes, pts_us: u64) -> Self {
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
            pts_us,
        }
    }

    pub fn payload(&self) -> &[u8] {
        let end = self.len.min(self.data.len());
        &self.data[self.offset.min(end)..end]
    }

    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }
}

/// One encoder output for one channel.
#[derive(Debug)]
pub struct AccessUnit {
    channel: ChannelId,
    packs: Vec<Pack>,
}

impl AccessUnit {
    /// Reserve descriptors for exactly `packs` packs.
    ///
    /// Fails with [`StreamError::PackAllocation`] instead of aborting when
    /// the allocation cannot be satisfied.
    pub fn try_with_capacity(channel: ChannelId, packs: usize) -> Result<Self> {
        let mut descriptors = Vec::new();
        descriptors
            .try_reserve_exact(packs)
            .map_err(|_| StreamError::PackAllocation { channel, packs })?;
        Ok(Self {
            channel,
            packs: descriptors,
        })
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn packs(&self) -> &[Pack] {
        &self.packs
    }

    /// Number of descriptors the unit was allocated for.
    pub fn capacity(&self) -> usize {
        self.packs.capacity()
    }

    /// Called by encoders while filling the unit during a fetch.
    pub fn push(&mut self, pack: Pack) {
        self.packs.push(pack);
    }

    /// PTS of the first pack; the whole unit shares one RTP timestamp.
    pub fn pts_us(&self) -> Option<u64> {
        self.packs.first().map(|p| p.pts_us)
    }

    pub fn payload_len(&self) -> usize {
        self.packs.iter().map(Pack::payload_len).sum()
    }
}

/// The hardware encoder as seen by the dispatch loop.
pub trait Encoder: Send {
    /// Number of packs in the next finished access unit, 0 if none.
    fn pending_packs(&mut self, channel: ChannelId) -> Result<usize>;

    /// Fill `unit` with the packs of the next access unit.
    ///
    /// On error the unit must be treated as never acquired.
    fn fetch(&mut self, channel: ChannelId, unit: &mut AccessUnit) -> Result<()>;

    /// Hand the buffers of a fetched unit back to the encoder.
    fn release(&mut self, channel: ChannelId, unit: &AccessUnit) -> Result<()>;
}

/// A fetched access unit that is released when dropped.
pub struct Acquired<'a, E: Encoder + ?Sized> {
    encoder: &'a mut E,
    unit: AccessUnit,
    release_failed: Option<&'a mut u64>,
}

impl<'a, E: Encoder + ?Sized> Acquired<'a, E> {
    /// Fetch the next unit of `channel` into `unit`.
    ///
    /// `release_errors` is incremented if the eventual release fails.
    pub fn fetch(
        encoder: &'a mut E,
        mut unit: AccessUnit,
        release_errors: Option<&'a mut u64>,
    ) -> Result<Self> {
        encoder.fetch(unit.channel, &mut unit)?;
        Ok(Self {
            encoder,
            unit,
            release_failed: release_errors,
        })
    }

    pub fn unit(&self) -> &AccessUnit {
        &self.unit
    }
}

impl<E: Encoder + ?Sized> Drop for Acquired<'_, E> {
    fn drop(&mut self) {
        let channel = self.unit.channel;
        if let Err(e) = self.encoder.release(channel, &self.unit) {
            tracing::warn!(%channel, error = %e, "failed to release access unit");
            if let Some(count) = self.release_failed.as_deref_mut() {
                *count += 1;
            }
        }
    }
}
