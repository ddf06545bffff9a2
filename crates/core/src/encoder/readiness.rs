//! Readiness fan-in for encoder channels.
//!
//! Producers (the encoder side) hold one [`ReadyHandle`] per channel and
//! call [`ReadyHandle::notify`] whenever an access unit is finished. The
//! dispatch worker blocks in [`Multiplexer::wait`] until at least one
//! channel is ready or the timeout expires.
//!
//! Notifications are counted: each one makes its channel ready for one
//! wait cycle, so a channel with two finished units is reported by two
//! consecutive waits even if both notifications arrived before the first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::ChannelId;
use crate::error::{Result, StreamError};

/// Maximum number of channels a [`Multiplexer`] can watch.
pub const MAX_CHANNELS: usize = 16;

#[derive(Debug, Default)]
struct ReadySet {
    /// Registered channels in registration order, with pending notifications.
    slots: Vec<(ChannelId, u32)>,
    /// Live producer handles.
    producers: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ReadySet>,
    cond: Condvar,
}

/// Waits on the readiness of a bounded set of channels.
#[derive(Debug, Default)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel and return the handle its producer notifies.
    pub fn register(&self, channel: ChannelId) -> Result<ReadyHandle> {
        let mut state = self.shared.state.lock();
        if state.slots.iter().any(|(id, _)| *id == channel) {
            return Err(StreamError::DuplicateChannel(channel));
        }
        if state.slots.len() >= MAX_CHANNELS {
            return Err(StreamError::TooManyChannels {
                limit: MAX_CHANNELS,
            });
        }
        state.slots.push((channel, 0));
        state.producers += 1;
        tracing::debug!(%channel, registered = state.slots.len(), "channel registered for readiness");

        Ok(ReadyHandle {
            shared: self.shared.clone(),
            slot: state.slots.len() - 1,
            channel,
        })
    }

    pub fn is_registered(&self, channel: ChannelId) -> bool {
        self.shared
            .state
            .lock()
            .slots
            .iter()
            .any(|(id, _)| *id == channel)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least one channel is ready or `timeout` elapses.
    ///
    /// Returns the ready channels in registration order, consuming one
    /// notification from each; an empty vec means the wait timed out.
    /// Fails with [`StreamError::ReadinessClosed`] once every producer
    /// handle has been dropped and nothing is pending.
    pub fn wait(&self, timeout: Duration) -> Result<Vec<ChannelId>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        loop {
            let ready: Vec<ChannelId> = state
                .slots
                .iter_mut()
                .filter(|(_, pending)| *pending > 0)
                .map(|(id, pending)| {
                    *pending -= 1;
                    *id
                })
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
            if state.producers == 0 {
                return Err(StreamError::ReadinessClosed);
            }
            if self
                .shared
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(Vec::new());
            }
        }
    }
}

/// Producer side of one channel's readiness.
#[derive(Debug)]
pub struct ReadyHandle {
    shared: Arc<Shared>,
    slot: usize,
    channel: ChannelId,
}

impl ReadyHandle {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Signal one finished access unit.
    pub fn notify(&self) {
        let mut state = self.shared.state.lock();
        state.slots[self.slot].1 = state.slots[self.slot].1.saturating_add(1);
        drop(state);
        self.shared.cond.notify_all();
    }
}

impl Drop for ReadyHandle {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.producers -= 1;
        drop(state);
        self.shared.cond.notify_all();
    }
}
