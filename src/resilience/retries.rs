//! Failover decisions.
//!
//! # Responsibilities
//! - Decide whether a failed attempt may be repeated on another server
//!
//! # Design Decisions
//! - At most one failover per request
//! - Only connection-level failures qualify: connect/transport errors,
//!   rejected handshakes, and connections that died before answering
//! - Capacity and timeout errors are surfaced, never retried
//! - The server that failed is excluded from the second attempt

use crate::error::ClientError;

/// One-shot failover policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverPolicy {
    enabled: bool,
    max_attempts: u32,
}

impl FailoverPolicy {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            max_attempts: if enabled { 2 } else { 1 },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether attempt number `attempt` (1-based) that failed with `err`
    /// should be followed by another attempt.
    pub fn should_retry(&self, attempt: u32, err: &ClientError) -> bool {
        self.enabled && attempt < self.max_attempts && err.is_connection_failure()
    }
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::new(true)
    }
}
