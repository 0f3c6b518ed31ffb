use std::fmt;
use std::time::Instant;

/// Per-agent link counters.
#[derive(Debug, Clone)]
pub struct LinkStats {
    pub sent: u64,
    pub received: u64,
    /// Replies dropped for a wrong command echo or sequence number.
    pub discarded: u64,
    pub timeouts: u64,
    /// Operations that ended in an error.
    pub failed: u64,
    pub bytes_out: u64,
    pub bytes_in: u64,
    t0: Instant,
}

impl LinkStats {
    pub fn new() -> Self {
        Self {
            sent: 0,
            received: 0,
            discarded: 0,
            timeouts: 0,
            failed: 0,
            bytes_out: 0,
            bytes_in: 0,
            t0: Instant::now(),
        }
    }

    pub fn on_send(&mut self, n: usize) {
        self.sent += 1;
        self.bytes_out += n as u64;
    }
    pub fn on_recv(&mut self, n: usize) {
        self.received += 1;
        self.bytes_in += n as u64;
    }
    pub fn inc_discarded(&mut self) {
        self.discarded += 1;
    }
    pub fn inc_timeouts(&mut self) {
        self.timeouts += 1;
    }
    pub fn inc_failed(&mut self) {
        self.failed += 1;
    }
}

impl Default for LinkStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
        write!(
            f,
            "sent={} recv={} discarded={} timeouts={} failed={} out={}B in={}B over {:.1}s",
            self.sent,
            self.received,
            self.discarded,
            self.timeouts,
            self.failed,
            self.bytes_out,
            self.bytes_in,
            dur
        )
    }
}
