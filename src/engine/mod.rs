//! Worker runtime: serial lock protocol, poll backoff and the main loop.

pub mod backoff;
pub mod lock;
pub mod worker;

pub use backoff::{Backoff, BackoffConfig};
pub use lock::{Lease, LockOutcome};
pub use worker::{Cycle, Worker, WorkerConfig};
