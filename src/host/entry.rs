use super::HostKey;

/// EMA smoothing factor for the rate estimate and its bounds.
const RATE_ALPHA: f64 = 0.1;

/// Per-host slot count and throughput observations.
///
/// The rate estimate is advisory telemetry: a wide `saturation_band` hints
/// that adding transports to this host no longer adds throughput. Admission
/// never reads it.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub key: HostKey,
    /// Number of transports currently active against this host.
    pub active: usize,
    /// Running bytes transferred by in-flight attempts (retracted on settle).
    pub bytes_transferred: f64,
    /// Running busy time in milliseconds (retracted on settle).
    pub busy_ms: f64,
    /// Smoothed throughput in bytes/ms/request. `None` until the first sample.
    pub rate_estimate: Option<f64>,
    /// One-sided EMA that only moves up when a sample exceeds the estimate.
    pub rate_upper: f64,
    /// One-sided EMA that only moves down when a sample undercuts the estimate.
    pub rate_lower: f64,
}

impl HostEntry {
    pub(super) fn new(key: HostKey) -> Self {
        Self {
            key,
            active: 0,
            bytes_transferred: 0.0,
            busy_ms: 0.0,
            rate_estimate: None,
            rate_upper: 0.0,
            rate_lower: 0.0,
        }
    }

    /// Fold one throughput sample (bytes/ms/request) into the running
    /// estimate. Non-finite samples (no busy time yet) are ignored.
    pub fn record_sample(&mut self, rate: f64) {
        if !rate.is_finite() {
            return;
        }
        match self.rate_estimate {
            None => {
                self.rate_estimate = Some(rate);
                self.rate_upper = rate;
                self.rate_lower = rate;
            }
            Some(estimate) => {
                if rate < estimate {
                    self.rate_lower = RATE_ALPHA * rate + (1.0 - RATE_ALPHA) * self.rate_lower;
                } else if rate > estimate {
                    self.rate_upper = RATE_ALPHA * rate + (1.0 - RATE_ALPHA) * self.rate_upper;
                }
                self.rate_estimate = Some(RATE_ALPHA * rate + (1.0 - RATE_ALPHA) * estimate);
            }
        }
    }

    /// Ratio of the upper to the lower rate bound. A large ratio means
    /// per-request throughput is swinging wildly, which usually indicates
    /// the host's connection count is saturated. `None` until samples exist.
    pub fn saturation_band(&self) -> Option<f64> {
        self.rate_estimate?;
        if self.rate_lower <= 0.0 {
            return None;
        }
        Some(self.rate_upper / self.rate_lower)
    }

    /// Recompute and fold a rate sample from the running totals.
    pub(super) fn fold_current_rate(&mut self) {
        if self.busy_ms > 0.0 && self.active > 0 {
            let sample = self.bytes_transferred / self.busy_ms / self.active as f64;
            self.record_sample(sample);
        }
    }
}
