//! Concurrency primitives shared by the worker.
//!
//! Three small building blocks that are deliberately independent of each
//! other:
//!
//! - [`KeyedMutex`]: per-key mutual exclusion (pull vs delete of one
//!   scope).
//! - [`FlightGroup`]: single-flight rendezvous, where concurrent callers
//!   with the same key share one execution and all observe its result.
//! - [`with_retry`]: bounded retry with a fixed delay and a break-out
//!   sentinel.

mod flight;
mod kmutex;
mod retry;

pub use flight::FlightGroup;
pub use kmutex::{KeyedGuard, KeyedMutex};
pub use retry::{with_retry, RetryError};
