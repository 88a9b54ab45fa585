//! Server health state machine.
//!
//! # States
//! - Unknown: never observed; receives traffic like a healthy server
//! - Healthy: receives traffic
//! - Unhealthy: deprioritized by the load balancer, probed with backoff
//!
//! # State Transitions
//! ```text
//! Unknown/Healthy → Unhealthy: consecutive failures >= unhealthy_failure_threshold
//!                              or a connection idled past unhealthy_threshold
//! Unhealthy → Healthy:         probe succeeded or a request succeeded
//! ```
//!
//! # Design Decisions
//! - State is a single atomic; transitions use compare-and-swap
//! - Failure counters reset on any success
//! - Probe schedule resets on every transition

use serde::Serialize;

/// Health of one server.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

impl HealthState {
    /// Unknown counts as healthy.
    pub fn is_selectable(self) -> bool {
        self != HealthState::Unhealthy
    }

    pub fn label(self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
