use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::dispatch::Dispatcher;
use crate::encoder::Encoder;
use crate::error::{Result, StreamError};
use crate::stats::DispatchStats;
use crate::transport::PacketSink;

/// Name of the dispatch worker thread.
pub const WORKER_NAME: &str = "venc-stream";

/// Owns the dispatch worker thread.
///
/// The worker runs [`Dispatcher::run`] until [`stop`](Self::stop) is called
/// or the loop hits a fatal error. [`join`](Self::join) hands back the
/// worker's outcome together with its counters.
#[derive(Debug, Default)]
pub struct Streamer {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<DispatchStats>>>,
}

impl Streamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<E, S>(&mut self, mut dispatcher: Dispatcher<E, S>) -> Result<()>
    where
        E: Encoder + 'static,
        S: PacketSink + 'static,
    {
        if self.worker.is_some() {
            return Err(StreamError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let worker = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || {
                let result = dispatcher.run(&running);
                running.store(false, Ordering::SeqCst);
                result.map(|()| dispatcher.stats().clone())
            });
        match worker {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        tracing::info!(worker = WORKER_NAME, "streamer started");
        Ok(())
    }

    /// Ask the worker to stop after its current wait cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("streamer stopping");
    }

    /// Whether the worker is still looping.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for the worker to finish and return its outcome.
    pub fn join(&mut self) -> Result<DispatchStats> {
        let worker = self.worker.take().ok_or(StreamError::NotStarted)?;
        worker.join().map_err(|_| StreamError::WorkerPanicked)?
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            if let Err(e) = self.join() {
                tracing::warn!(error = %e, "dispatch worker ended with an error");
            }
        }
    }
}
