//! reqsched: a priority-aware request scheduler.
//!
//! Mediates between many independent callers wanting to fetch remote
//! resources and a small shared pool of concurrent transport slots, both
//! globally and per host. Requests are reordered, throttled, deferred, and
//! cancelled based on a caller-supplied priority key so the most relevant
//! data is fetched first under a hard concurrency ceiling. The transport
//! itself is an opaque caller-supplied invoker; the scheduler never
//! interprets the bytes.

pub mod config;
pub mod logging;

pub mod heap;
pub mod host;
pub mod request;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use request::{InvalidRequest, Request, RequestClass, RequestId, ResultHandle};
pub use scheduler::{Scheduler, SchedulerStats};
