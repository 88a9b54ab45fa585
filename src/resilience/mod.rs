//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request attempt fails:
//!     → retries.rs (connection-level failure? fail over once to another server)
//!
//! Server marked unhealthy:
//!     → backoff.rs (space probes: base * 2^(n-1), capped, jittered)
//! ```
//!
//! # Design Decisions
//! - Every external call has a deadline (connect, handshake, acquire, request)
//! - Failover is one-shot and excludes the server that failed
//! - Jittered backoff prevents probe storms against a recovering server

pub mod backoff;
pub mod retries;

pub use backoff::{calculate_backoff, Backoff};
pub use retries::FailoverPolicy;
