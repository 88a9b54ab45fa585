//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connections, pools, health monitor, client:
//!     → logging.rs (structured tracing events with server / connection fields)
//!     → metrics.rs (counters, gauges, histograms via the `metrics` facade)
//!
//! Consumers:
//!     → Any tracing subscriber (stdout by default, see logging::init)
//!     → Prometheus scrape endpoint, when installed by the embedding binary
//! ```
//!
//! # Design Decisions
//! - The library never installs a subscriber or recorder on its own
//! - Metric updates are no-ops until a recorder is installed

pub mod logging;
pub mod metrics;
