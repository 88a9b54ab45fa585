//! Connection pooling, load balancing and request correlation for clients of
//! a clustered backend speaking a length-prefixed binary RPC protocol.
//!
//! # Data Flow
//! ```text
//! Client::send_request
//!     → load_balancer (pick a healthy server)
//!     → pool (idle connection, new connection, or wait)
//!     → net::connection (register with correlator, write frame)
//!     → I/O task decodes response frame → correlator completes the future
//!     → connection returns to its pool
//!
//! health::monitor sweeps pools and probes unhealthy servers in the background
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod pool;
pub mod resilience;

pub use client::Client;
pub use config::{ClientConfig, LoadBalanceStrategy};
pub use error::{ClientError, CloseReason, ErrorKind, ProtocolError};
pub use net::address::ServerAddress;
pub use net::frame::FrameCodec;
pub use net::message::RequestId;
pub use pool::PoolStats;
