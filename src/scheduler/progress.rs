//! Per-attempt progress reporting into the host rate estimator.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::host::{HostKey, HostTable};

/// Handed to a transport invoker for one attempt. `report` feeds cumulative
/// byte counts into the owning host's throughput estimate; when the attempt
/// ends (success, failure, or abort) the drop impl backs its contribution
/// out of the running totals so the estimate tracks only in-flight work.
pub struct ProgressReporter {
    hosts: Arc<Mutex<HostTable>>,
    host: HostKey,
    started: Instant,
    bytes_seen: u64,
    elapsed_ms: f64,
}

impl ProgressReporter {
    pub(crate) fn new(hosts: Arc<Mutex<HostTable>>, host: HostKey) -> Self {
        Self {
            hosts,
            host,
            started: Instant::now(),
            bytes_seen: 0,
            elapsed_ms: 0.0,
        }
    }

    /// Report the attempt's cumulative bytes transferred so far.
    /// Counts that go backwards are clamped (the delta is never negative).
    pub fn report(&mut self, cumulative_bytes: u64) {
        let now_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let delta = cumulative_bytes.saturating_sub(self.bytes_seen);
        self.hosts
            .lock()
            .unwrap()
            .record_progress(&self.host, delta, self.elapsed_ms, now_ms);
        self.bytes_seen = self.bytes_seen.max(cumulative_bytes);
        self.elapsed_ms = now_ms;
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if self.bytes_seen > 0 || self.elapsed_ms > 0.0 {
            self.hosts
                .lock()
                .unwrap()
                .retract(&self.host, self.bytes_seen, self.elapsed_ms);
        }
    }
}
