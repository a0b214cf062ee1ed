use std::collections::HashMap;

use crate::config::SchedulerConfig;

use super::entry::HostEntry;
use super::HostKey;

/// Lazily-populated table of per-host entries.
///
/// Owned by the scheduler context behind its own lock so progress reporters
/// running inside transport tasks can feed the rate estimator without
/// touching the rest of the scheduler state.
#[derive(Debug, Default)]
pub struct HostTable {
    entries: HashMap<HostKey, HostEntry>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &HostKey) -> Option<&HostEntry> {
        self.entries.get(key)
    }

    pub(crate) fn entry_mut(&mut self, key: &HostKey) -> &mut HostEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| HostEntry::new(key.clone()))
    }

    /// Active transport count for a host (0 if never referenced).
    pub fn active(&self, key: &HostKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.active)
    }

    /// True iff a new transport may start against `key`: throttling is off,
    /// or both the global and the per-host ceiling have room.
    pub fn has_capacity(&self, key: &HostKey, cfg: &SchedulerConfig, active_global: usize) -> bool {
        if !cfg.throttle {
            return true;
        }
        active_global < cfg.maximum_requests && self.active(key) < cfg.maximum_requests_per_host
    }

    /// Slots still open at this host under the per-host ceiling.
    pub fn remaining_slots(&self, key: &HostKey, cfg: &SchedulerConfig) -> usize {
        cfg.maximum_requests_per_host.saturating_sub(self.active(key))
    }

    pub(crate) fn add_active(&mut self, key: &HostKey) {
        self.entry_mut(key).active += 1;
    }

    pub(crate) fn remove_active(&mut self, key: &HostKey) {
        let entry = self.entry_mut(key);
        entry.active = entry.active.saturating_sub(1);
    }

    /// Apply one progress event from an in-flight attempt.
    ///
    /// `prev_elapsed_ms`/`now_elapsed_ms` are the attempt's cumulative busy
    /// time before and after this event; the attempt's previous contribution
    /// is replaced rather than double-counted. A fresh rate sample
    /// (bytes/ms/request) is folded into the host's estimate.
    pub fn record_progress(
        &mut self,
        key: &HostKey,
        bytes_delta: u64,
        prev_elapsed_ms: f64,
        now_elapsed_ms: f64,
    ) {
        let entry = self.entry_mut(key);
        entry.busy_ms += now_elapsed_ms - prev_elapsed_ms;
        entry.bytes_transferred += bytes_delta as f64;
        entry.fold_current_rate();
    }

    /// Back out a settled attempt's contribution from the running totals so
    /// the estimate tracks only in-flight work, then refold the rate.
    pub fn retract(&mut self, key: &HostKey, bytes: u64, elapsed_ms: f64) {
        let entry = self.entry_mut(key);
        entry.bytes_transferred = (entry.bytes_transferred - bytes as f64).max(0.0);
        entry.busy_ms = (entry.busy_ms - elapsed_ms).max(0.0);
        entry.fold_current_rate();
    }

    /// Hosts with at least one active transport, for telemetry snapshots.
    pub fn active_by_host(&self) -> HashMap<HostKey, usize> {
        self.entries
            .iter()
            .filter(|(_, e)| e.active > 0)
            .map(|(k, e)| (k.clone(), e.active))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
