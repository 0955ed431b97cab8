//! # logwatch — Live Log Tailing and Threshold Alerting
//!
//! Backend for an operations dashboard: tails a VictoriaLogs stream, fans
//! records out to per-task subscribers, and escalates severe records into a
//! mute-aware alert state with per-task unread counts.
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`pipeline`] | Owns and wires everything for one service |
//! | [`tail`] | Streaming connection with reconnect state machine |
//! | [`page`] | Paginated history queries with in-flight dedup |
//! | [`backoff`] | Retry with exponential backoff |
//! | [`hub`] | Per-task fan-out of tail batches |
//! | [`threshold`] | Severity ladder and display filter |
//! | [`mute`] | Alert overlay and mute windows |
//! | [`tasks`] | Watched tasks, unread counts, current view |
//! | [`record`], [`selector`] | Record decoding and stream selectors |
//! | [`config`], [`store`], [`metrics`], [`clock`], [`error`] | Supporting pieces |

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod mute;
pub mod page;
pub mod pipeline;
pub mod record;
pub mod selector;
pub mod store;
pub mod tail;
pub mod tasks;
pub mod threshold;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{Error, Result};
pub use pipeline::LogPipeline;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
