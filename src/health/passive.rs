//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Track consecutive failures
//! - Trigger state transition on threshold breach
//!
//! # Design Decisions
//! - Transport, protocol and authentication errors count as failures
//! - Timeouts, capacity and decode errors are NOT failures (the server answered
//!   or was never reached for a reason of our own)
//! - Counters live on the ServerNode atomics, so observation is lock-free

use crate::error::ClientError;
use crate::load_balancer::ServerNode;

/// Feeds request outcomes into server health.
#[derive(Debug, Clone, Copy)]
pub struct PassiveHealth {
    failure_threshold: u32,
}

impl PassiveHealth {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Record the outcome of one request against `server`.
    pub fn observe<T>(&self, server: &ServerNode, outcome: &Result<T, ClientError>) {
        match outcome {
            Ok(_) => {
                server.mark_success();
            }
            Err(e) if e.counts_against_server() => {
                tracing::debug!(server = %server.addr(), error = %e, "Request failure counted against server");
                server.mark_failure(self.failure_threshold);
            }
            Err(_) => {}
        }
    }
}
