//! The owned scheduler state machine.
//!
//! `SchedulerContext` holds every mutable structure (heap, deferred queue,
//! host table, budgets, counters) behind one lock in the `Scheduler` shell.
//! Entry points here are synchronous and run to completion; instead of
//! spawning transports they return `Launch` orders for the shell to spawn
//! after the lock is released, which keeps the whole engine deterministic
//! and testable without a runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::heap::{PriorityHeap, SortKey};
use crate::host::{HostKey, HostTable};
use crate::request::{
    InvalidRequest, Request, RequestClass, RequestId, RequestState, ResultHandle, TransportFn,
    TransportOutcome,
};

use super::budget::BudgetTable;
use super::progress::ProgressReporter;
use super::stats::SchedulerStats;

/// One request as tracked by the scheduler.
pub(crate) struct ScheduledRequest {
    pub(crate) id: RequestId,
    pub(crate) url: String,
    pub(crate) host: HostKey,
    pub(crate) class: RequestClass,
    pub(crate) priority: f64,
    pub(crate) droppable: bool,
    pub(crate) invoker: TransportFn,
    pub(crate) state: RequestState,
    /// Bumped on supersession so a settle from an aborted attempt is
    /// recognized as stale and ignored.
    pub(crate) generation: u32,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) result_tx: Option<oneshot::Sender<TransportOutcome>>,
}

impl ScheduledRequest {
    pub(crate) fn set_state(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal transition {:?} -> {:?} for {}",
            self.state,
            next,
            self.id
        );
        self.state = next;
    }

    fn sort_key(&self) -> SortKey {
        SortKey {
            priority: self.priority,
            seq: self.id.0,
        }
    }
}

/// Order to spawn one transport attempt, produced under the lock and
/// executed by the shell after releasing it.
pub(crate) struct Launch {
    pub(crate) id: RequestId,
    pub(crate) generation: u32,
    pub(crate) url: String,
    pub(crate) invoker: TransportFn,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: ProgressReporter,
}

pub(crate) struct SchedulerContext {
    pub(crate) cfg: SchedulerConfig,
    pub(crate) requests: HashMap<RequestId, ScheduledRequest>,
    pub(crate) heap: PriorityHeap,
    /// Non-droppable requests waiting for a slot, strict arrival order.
    pub(crate) deferred: VecDeque<RequestId>,
    /// Shared with progress reporters running inside transport tasks.
    pub(crate) hosts: Arc<Mutex<HostTable>>,
    pub(crate) budgets: BudgetTable,
    /// Droppable requests that could not be admitted this tick; feed the
    /// next tick's budget allocation.
    pub(crate) leftovers: Vec<RequestId>,
    pub(crate) active_global: usize,
    pub(crate) attempted_this_tick: usize,
    next_id: u64,
}

impl SchedulerContext {
    pub(crate) fn new(cfg: SchedulerConfig) -> Self {
        Self {
            cfg,
            requests: HashMap::new(),
            heap: PriorityHeap::new(),
            deferred: VecDeque::new(),
            hosts: Arc::new(Mutex::new(HostTable::new())),
            budgets: BudgetTable::default(),
            leftovers: Vec::new(),
            active_global: 0,
            attempted_this_tick: 0,
            next_id: 0,
        }
    }

    /// Validate and enqueue a request. The transport does not start here;
    /// admission happens on the next tick or completion pass.
    pub(crate) fn submit_inner(
        &mut self,
        request: Request,
    ) -> Result<(RequestId, ResultHandle), InvalidRequest> {
        if request.url.is_empty() {
            return Err(InvalidRequest::MissingUrl);
        }
        let invoker = request.invoker.ok_or(InvalidRequest::MissingInvoker)?;
        if !request.priority.is_finite() {
            return Err(InvalidRequest::NonFinitePriority(request.priority));
        }
        let host = HostKey::from_url(&request.url)?;

        let id = RequestId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let scheduled = ScheduledRequest {
            id,
            url: request.url,
            host,
            class: request.class,
            priority: request.priority,
            droppable: request.droppable,
            invoker,
            state: RequestState::Pending,
            generation: 0,
            cancel: None,
            result_tx: Some(tx),
        };
        self.heap.push(scheduled.sort_key(), id);
        self.requests.insert(id, scheduled);
        self.attempted_this_tick += 1;
        Ok((id, ResultHandle { rx }))
    }

    /// Remove a request from consideration without settling its handle.
    /// Idempotent; unknown ids are ignored. An active request's transport
    /// is aborted and the freed slot is immediately re-offered to waiting
    /// requests, deferred head first.
    pub(crate) fn withdraw(&mut self, id: RequestId) -> Vec<Launch> {
        let Some(mut req) = self.requests.remove(&id) else {
            return Vec::new();
        };
        self.heap.remove(id);
        self.deferred.retain(|d| *d != id);
        self.leftovers.retain(|d| *d != id);
        let mut launches = Vec::new();
        if req.state == RequestState::Active {
            if let Some(cancel) = req.cancel.take() {
                cancel.cancel();
            }
            self.release_slot(&req.host);
            launches = self.drain_deferred();
            launches.extend(self.schedule_pass());
        }
        tracing::trace!(request = %id, "withdrawn");
        // result_tx drops here; the caller observes abandonment.
        launches
    }

    /// Start a pending request: mark it active, bump counters, and return
    /// the launch order for the shell.
    pub(crate) fn start(&mut self, id: RequestId) -> Option<Launch> {
        let hosts = Arc::clone(&self.hosts);
        let req = self.requests.get_mut(&id)?;
        req.set_state(RequestState::Active);
        let cancel = CancellationToken::new();
        req.cancel = Some(cancel.clone());
        let host = req.host.clone();
        let launch = Launch {
            id,
            generation: req.generation,
            url: req.url.clone(),
            invoker: Arc::clone(&req.invoker),
            cancel,
            progress: ProgressReporter::new(hosts, host.clone()),
        };
        self.active_global += 1;
        self.hosts.lock().unwrap().add_active(&host);
        Some(launch)
    }

    /// Abort an active request's transport because the near set strictly
    /// outranks it. The request returns to Pending (it stays in the heap
    /// for future passes) and its handle is left unsettled.
    pub(crate) fn supersede(&mut self, id: RequestId) {
        let Some(req) = self.requests.get_mut(&id) else {
            return;
        };
        if req.state != RequestState::Active {
            return;
        }
        req.set_state(RequestState::Canceled);
        if let Some(cancel) = req.cancel.take() {
            cancel.cancel();
        }
        req.generation += 1;
        req.set_state(RequestState::Pending);
        let host = req.host.clone();
        self.release_slot(&host);
        tracing::trace!(request = %id, "superseded");
    }

    /// React to a transport settling. Stale settles (the attempt was
    /// superseded or the request withdrawn) are ignored. Frees the slot,
    /// settles the caller's handle, then offers the freed slot to the
    /// deferred head and runs one more scheduling pass.
    pub(crate) fn on_settled(
        &mut self,
        id: RequestId,
        generation: u32,
        outcome: TransportOutcome,
    ) -> Vec<Launch> {
        let Some(mut req) = self.requests.remove(&id) else {
            return Vec::new();
        };
        if req.state != RequestState::Active || req.generation != generation {
            self.requests.insert(id, req);
            return Vec::new();
        }

        if outcome.is_ok() {
            req.set_state(RequestState::Completed);
        } else {
            req.set_state(RequestState::Failed);
            tracing::debug!(request = %id, host = %req.host, "transport failed");
        }
        self.heap.remove(id);
        self.release_slot(&req.host);
        if let Some(tx) = req.result_tx.take() {
            let _ = tx.send(outcome);
        }

        let mut launches = self.drain_deferred();
        launches.extend(self.schedule_pass());
        launches
    }

    /// Promote deferred heads for as long as capacity allows.
    pub(crate) fn drain_deferred(&mut self) -> Vec<Launch> {
        let mut launches = Vec::new();
        while let Some(launch) = self.promote_deferred() {
            launches.push(launch);
        }
        launches
    }

    /// Admit the deferred head if its host has capacity. Strict FIFO: the
    /// queue is never searched past the head.
    pub(crate) fn promote_deferred(&mut self) -> Option<Launch> {
        let head = *self.deferred.front()?;
        let host = self.requests.get(&head)?.host.clone();
        let capacity =
            self.hosts
                .lock()
                .unwrap()
                .has_capacity(&host, &self.cfg, self.active_global);
        if !capacity {
            return None;
        }
        self.deferred.pop_front();
        self.start(head)
    }

    pub(crate) fn statistics(&self) -> SchedulerStats {
        SchedulerStats {
            attempted_this_tick: self.attempted_this_tick,
            active_global: self.active_global,
            active_by_host: self.hosts.lock().unwrap().active_by_host(),
        }
    }

    /// Clear all scheduler state, aborting in-flight transports and
    /// dropping unsettled handles. Used between independent sessions.
    /// Ids stay monotonic so a settle from a pre-reset attempt can never
    /// alias a post-reset request.
    pub(crate) fn reset(&mut self) {
        for req in self.requests.values_mut() {
            if let Some(cancel) = req.cancel.take() {
                cancel.cancel();
            }
        }
        self.requests.clear();
        self.heap.clear();
        self.deferred.clear();
        self.leftovers.clear();
        self.budgets.clear();
        self.hosts.lock().unwrap().clear();
        self.active_global = 0;
        self.attempted_this_tick = 0;
    }

    fn release_slot(&mut self, host: &HostKey) {
        self.active_global = self.active_global.saturating_sub(1);
        self.hosts.lock().unwrap().remove_active(host);
    }
}
