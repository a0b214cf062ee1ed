//! Request scheduler: mediates many callers against a small shared pool of
//! concurrent transport slots, globally and per host.
//!
//! Callers `submit` requests carrying a priority key (lower = more
//! important, typically distance-to-viewer) and call `tick` once per
//! scheduling period. Each tick the engine picks the near set — everything
//! within the nearness band of the best priority — aborts active transports
//! the near set strictly outranks, and starts as many near-set members as
//! global, per-host, and per-(host, class) budget capacity allow. Transport
//! completions re-enter the engine to free slots, promote deferred
//! non-droppable work, and immediately re-offer the slot to the best
//! pending request.

mod budget;
mod context;
mod progress;
mod stats;
mod tick;

pub use budget::Budget;
pub use progress::ProgressReporter;
pub use stats::SchedulerStats;

use std::sync::{Arc, Mutex};

use crate::config::SchedulerConfig;
use crate::request::{InvalidRequest, Request, RequestId, ResultHandle, TransportTask};

use context::{Launch, SchedulerContext};

/// Handle to one scheduler instance.
///
/// Clones share state. All mutation is serialized behind a single lock, so
/// submits, ticks, withdrawals, and completion callbacks interleave safely
/// no matter which task they arrive on; nothing here suspends while the
/// lock is held.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Mutex<SchedulerContext>>,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerContext::new(cfg))),
        }
    }

    /// Submit a request for scheduling.
    ///
    /// Validation failures (empty url, missing invoker, unusable host,
    /// non-finite priority) surface synchronously and the request is never
    /// enqueued. On success the request waits for the next tick; the
    /// returned handle settles when its transport does, or reports
    /// abandonment if the request is withdrawn first.
    pub fn submit(&self, request: Request) -> Result<(RequestId, ResultHandle), InvalidRequest> {
        self.inner.lock().unwrap().submit_inner(request)
    }

    /// Advance scheduling by one period. The caller decides the cadence:
    /// once per render frame, or once per fixed interval in a non-graphical
    /// host.
    pub fn tick(&self) {
        let launches = self.inner.lock().unwrap().tick_inner();
        self.spawn_all(launches);
    }

    /// Remove a not-yet-settled request from consideration. Idempotent.
    /// The handle is never settled; an active transport is aborted and its
    /// slot re-offered to waiting requests.
    pub fn withdraw(&self, id: RequestId) {
        let launches = self.inner.lock().unwrap().withdraw(id);
        self.spawn_all(launches);
    }

    /// Read-only telemetry snapshot.
    pub fn statistics(&self) -> SchedulerStats {
        self.inner.lock().unwrap().statistics()
    }

    /// Clear all scheduler state (used between independent sessions).
    /// In-flight transports are aborted; unsettled handles report
    /// abandonment.
    pub fn reset(&self) {
        self.inner.lock().unwrap().reset();
    }

    /// Snapshot of one host's slot count and throughput telemetry, if the
    /// host has been referenced. The rate band is advisory; admission never
    /// reads it.
    pub fn host_snapshot(&self, key: &crate::host::HostKey) -> Option<crate::host::HostEntry> {
        let ctx = self.inner.lock().unwrap();
        let hosts = ctx.hosts.lock().unwrap();
        hosts.get(key).cloned()
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.lock().unwrap().cfg.clone()
    }

    /// Replace the configuration. Takes effect from the next admission
    /// decision; already-active transports are not re-evaluated.
    pub fn set_config(&self, cfg: SchedulerConfig) {
        self.inner.lock().unwrap().cfg = cfg;
    }

    fn spawn_all(&self, launches: Vec<Launch>) {
        for launch in launches {
            self.spawn_transport(launch);
        }
    }

    fn spawn_transport(&self, launch: Launch) {
        let sched = self.clone();
        tokio::spawn(async move {
            let Launch {
                id,
                generation,
                url,
                invoker,
                cancel,
                progress,
            } = launch;
            let transport = (invoker)(TransportTask { url, progress });
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Superseded, withdrawn, or reset: the transport future
                    // is dropped without settling the caller's handle.
                    tracing::trace!(request = %id, "transport dropped after abort");
                }
                outcome = transport => {
                    let follow_ups = sched.inner.lock().unwrap().on_settled(id, generation, outcome);
                    sched.spawn_all(follow_ups);
                }
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
