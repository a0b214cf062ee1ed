//! Per-host slot tracking and throughput telemetry.
//!
//! Tracks, per `(scheme, host, port)`: the number of active transports, a
//! smoothed throughput estimate (bytes/ms/request), and an asymmetric
//! upper/lower rate band usable to spot saturation. Entries are created
//! lazily on first reference and live for the life of the scheduler
//! context (cleared only by `reset`).

mod entry;
mod key;
mod table;

pub use entry::HostEntry;
pub use key::{HostKey, HostKeyError};
pub use table::HostTable;
