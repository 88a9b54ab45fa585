//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outgoing request
//!     → connection.rs (Ready → Busy, dispatch)
//!     → correlator.rs (register pending request)
//!     → message.rs (prefix request id)
//!     → frame.rs (prefix length, write)
//!
//! Inbound bytes
//!     → frame.rs (accumulate, split frames)
//!     → correlator.rs (match request id, run decoder, complete future)
//!
//! Connection States:
//!     Connecting → Ready ⇄ Busy → Closed
//! ```
//!
//! # Design Decisions
//! - One Tokio task owns each socket; callers reach it through a channel
//! - The handshake (handshake.rs) runs before the task starts
//! - Oversized or negative frame lengths close the connection

pub mod address;
pub mod connection;
pub mod correlator;
pub mod frame;
pub mod handshake;
pub mod message;
