//! Connection pooling and batched command queues for ObjectStore Rust.
//!
//! - [`ConnectionPool`]: one shared, reference-counted connection per
//!   connection string, closed after an idle grace period, with a sweep that
//!   reclaims connections leaked by exited threads.
//! - [`WorkerQueue`]: coalesces concurrently enqueued commands into one
//!   round trip and dispatches each item's result sets in order.
//! - [`QueueRegistry`]: one queue per (provider, connection string).
//! - [`Pending`]: blocking completion handle for queued work.

pub mod config;
pub mod pending;
pub mod pool;
pub mod queue;

#[cfg(test)]
mod test_support;

pub use config::PoolConfig;
pub use pending::{Completer, Pending, pending};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use queue::{Handled, QueueRegistry, WorkerQueue};
