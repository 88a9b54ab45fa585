//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Client::new:
//!     Validate config → Build balancer and pools → Spawn health monitor
//!
//! Client::close (or last handle dropped):
//!     Trigger shutdown → Monitor exits → Close pools → Fail waiters and
//!     pending requests
//! ```
//!
//! # Design Decisions
//! - Close never waits for in-flight work
//! - Shutdown is idempotent

pub mod shutdown;

pub use shutdown::Shutdown;
