use std::fmt;

/// Counters kept by the dispatch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Readiness waits that returned, ready or not.
    pub cycles: u64,
    /// Waits that timed out with nothing ready.
    pub timeouts: u64,
    /// Channels reported ready with no pending packs.
    pub empty_wakeups: u64,
    pub units_fetched: u64,
    pub units_released: u64,
    pub fetch_errors: u64,
    pub release_errors: u64,
    /// Access units whose dispatch failed (in part or in full).
    pub dispatch_errors: u64,
    pub rtp_packets: u64,
    pub rtp_bytes: u64,
    pub send_errors: u64,
    pub file_writes: u64,
    pub file_bytes: u64,
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cycles:          {} ({} timeouts)", self.cycles, self.timeouts)?;
        writeln!(f, "empty wakeups:   {}", self.empty_wakeups)?;
        writeln!(
            f,
            "access units:    {} fetched, {} released",
            self.units_fetched, self.units_released
        )?;
        writeln!(
            f,
            "errors:          {} fetch, {} release, {} dispatch, {} send",
            self.fetch_errors, self.release_errors, self.dispatch_errors, self.send_errors
        )?;
        writeln!(
            f,
            "rtp:             {} packets, {} bytes",
            self.rtp_packets, self.rtp_bytes
        )?;
        write!(
            f,
            "file:            {} writes, {} bytes",
            self.file_writes, self.file_bytes
        )
    }
}
