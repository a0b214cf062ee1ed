//! Request description, lifecycle states, and the caller-facing result handle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::host::HostKeyError;
use crate::scheduler::ProgressReporter;

/// Identity handed back by `submit` and accepted by `withdraw`.
///
/// Ids are assigned from a monotonic counter at submit time, so they double
/// as the insertion sequence number used to break priority ties
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Caller-defined category used for per-(host, class) budget bucketing,
/// e.g. terrain vs. imagery vs. model tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestClass(pub u32);

impl RequestClass {
    /// Default bucket for requests with no finer category.
    pub const OTHER: RequestClass = RequestClass(0);
}

impl Default for RequestClass {
    fn default() -> Self {
        RequestClass::OTHER
    }
}

/// Lifecycle state of a scheduled request.
///
/// `Canceled` is transient: a superseded request's transport is aborted and
/// the request returns to `Pending` for re-evaluation on a later pass.
/// Only `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Active,
    Canceled,
    Completed,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    /// Legal transitions: Pending→Active, Active→{Canceled, Completed, Failed},
    /// Canceled→Pending.
    pub(crate) fn can_transition(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Active) | (Active, Canceled) | (Active, Completed) | (Active, Failed) | (Canceled, Pending)
        )
    }
}

/// What a transport eventually produces: opaque payload bytes or an opaque
/// error. The scheduler never interprets either.
pub type TransportOutcome = anyhow::Result<Vec<u8>>;

/// Boxed future returned by a transport invoker.
pub type TransportFuture = Pin<Box<dyn Future<Output = TransportOutcome> + Send>>;

/// Transport invoker supplied per request. Invoked each time the request is
/// started, so a superseded request can be re-fetched on re-admission.
pub type TransportFn = Arc<dyn Fn(TransportTask) -> TransportFuture + Send + Sync>;

/// Handed to the transport invoker on each start: the url to fetch and a
/// progress reporter feeding the per-host rate estimator.
pub struct TransportTask {
    pub url: String,
    pub progress: ProgressReporter,
}

/// Caller-built description of one fetch.
///
/// `invoker` is an `Option` so that a malformed request (e.g. deserialized or
/// assembled field-by-field) surfaces as an `InvalidRequest` at submit time
/// rather than a panic.
pub struct Request {
    pub url: String,
    pub class: RequestClass,
    /// Lower is more important (typically a distance-to-viewer metric).
    pub priority: f64,
    /// May be silently skipped under capacity pressure and retried later.
    /// Non-droppable requests wait in the deferred queue instead.
    pub droppable: bool,
    pub invoker: Option<TransportFn>,
}

impl Request {
    pub fn new(url: impl Into<String>, invoker: TransportFn) -> Self {
        Self {
            url: url.into(),
            class: RequestClass::OTHER,
            priority: 0.0,
            droppable: true,
            invoker: Some(invoker),
        }
    }

    pub fn class(mut self, class: RequestClass) -> Self {
        self.class = class;
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn droppable(mut self, droppable: bool) -> Self {
        self.droppable = droppable;
        self
    }
}

/// Submit-time validation failure. The request is never enqueued.
#[derive(Debug, Error)]
pub enum InvalidRequest {
    #[error("request url is empty")]
    MissingUrl,
    #[error("request has no transport invoker")]
    MissingInvoker,
    #[error("priority key must be finite, got {0}")]
    NonFinitePriority(f64),
    #[error(transparent)]
    Host(#[from] HostKeyError),
}

/// Caller's handle to the eventual transport outcome.
///
/// The handle settles once the transport completes or fails. It never
/// settles for a withdrawn or perpetually-superseded request; withdrawal
/// (and scheduler reset) drop the sending side, which `outcome` reports as
/// `None` so callers can apply their own abandonment policy.
#[derive(Debug)]
pub struct ResultHandle {
    pub(crate) rx: oneshot::Receiver<TransportOutcome>,
}

impl ResultHandle {
    /// Waits for the outcome. `None` means the request was abandoned
    /// (withdrawn or the scheduler was reset) before its transport settled.
    pub async fn outcome(self) -> Option<TransportOutcome> {
        self.rx.await.ok()
    }

    /// Non-blocking probe, mainly for polling callers.
    pub fn try_outcome(&mut self) -> Result<TransportOutcome, oneshot::error::TryRecvError> {
        self.rx.try_recv()
    }
}
