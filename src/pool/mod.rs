//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! acquire(timeout)
//!     → idle Ready connection?            → mark Busy, hand out
//!     → total + creating < max_pool_size? → queue, spawn creation
//!     → waiters < max_pending_acquires?   → queue, wait until timeout
//!     → otherwise                         → PoolExhausted
//!
//! PooledConnection dropped
//!     → oldest waiter gets it (still Busy), else Busy → Ready, back to idle
//!
//! Connection closed (any cause)
//!     → ConnectionOwner::on_connection_closed → forgotten
//!     → replacement created if acquirers are queued
//! ```
//!
//! # Design Decisions
//! - One request in flight per connection
//! - Waiters are served strictly FIFO
//! - Pools are owned by a client's registry, never global

pub mod connection_pool;
pub mod registry;

pub use connection_pool::{ConnectionPool, PoolSettings, PoolStats, PooledConnection, SweepOutcome};
pub use registry::PoolRegistry;
