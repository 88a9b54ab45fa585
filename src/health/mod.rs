//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Sweep (monitor.rs), every sweep_interval:
//!     Each pool
//!         Ready, idle > idle_close_threshold       → close connection
//!         Ready, idle > unhealthy_threshold        → connection Unhealthy,
//!                                                    server marked unhealthy
//!         Unhealthy (from an earlier sweep)        → close connection
//!         Busy with overdue requests               → expire them
//!     Each unhealthy server with a probe due
//!         → connect + handshake within probe_timeout
//!         → success: healthy; failure: backoff next probe
//!
//! Passive checks (passive.rs):
//!     Request failure observed
//!     → Increment failure count
//!     → Update state.rs if threshold exceeded
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - Busy connections are never reclaimed
//! - Health state is per-server, not per-connection

pub mod monitor;
pub mod passive;
pub mod state;

pub use monitor::{probe_server, HealthMonitor, SweepReport};
pub use passive::PassiveHealth;
pub use state::HealthState;
