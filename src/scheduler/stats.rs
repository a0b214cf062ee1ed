//! Read-only telemetry snapshot.

use std::collections::HashMap;

use crate::host::HostKey;

/// Snapshot of scheduler activity, cheap to take under the context lock.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Requests submitted since the last tick started.
    pub attempted_this_tick: usize,
    /// Transports currently active across all hosts.
    pub active_global: usize,
    /// Transports currently active per host (hosts with zero omitted).
    pub active_by_host: HashMap<HostKey, usize>,
}

impl SchedulerStats {
    /// Emit the snapshot to the tracing sink. Quiet when nothing happened.
    pub(crate) fn emit(&self) {
        if self.attempted_this_tick > 0 {
            tracing::debug!(attempted = self.attempted_this_tick, "requests attempted this tick");
        }
        if self.active_global > 0 {
            tracing::debug!(active = self.active_global, "requests active");
        }
        for (host, active) in &self.active_by_host {
            tracing::debug!(host = %host, active = *active, "requests active on host");
        }
    }
}
