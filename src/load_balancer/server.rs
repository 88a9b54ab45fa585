//! Server abstraction.
//!
//! # Responsibilities
//! - Represent a single candidate server
//! - Track requests in flight (for Least Connections LB)
//! - Track health state and consecutive failures/successes
//! - Schedule probes while unhealthy

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::health::state::HealthState;
use crate::net::address::ServerAddress;
use crate::observability::metrics;
use crate::resilience::backoff::Backoff;

#[derive(Debug, Default)]
struct ProbeSchedule {
    attempts: u32,
    last_probe_at: Option<Instant>,
    /// None while unhealthy means "probe on the next sweep".
    next_probe_at: Option<Instant>,
}

/// A single candidate server.
#[derive(Debug)]
pub struct ServerNode {
    addr: ServerAddress,
    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    /// Requests currently in flight against this server.
    in_flight: AtomicUsize,
    probe: Mutex<ProbeSchedule>,
}

impl ServerNode {
    pub fn new(addr: ServerAddress) -> Self {
        Self {
            addr,
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            probe: Mutex::new(ProbeSchedule::default()),
        }
    }

    pub fn addr(&self) -> &ServerAddress {
        &self.addr
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Healthy or Unknown.
    pub fn is_healthy(&self) -> bool {
        self.health().is_selectable()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Count a request as in flight until the guard drops.
    pub fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            server: self.clone(),
        }
    }

    // --- Health Logic ---

    /// Report a successful request or probe. Returns true if the server
    /// recovered from Unhealthy.
    pub fn mark_success(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.consecutive_successes.fetch_add(1, Ordering::Relaxed);

        let previous = self.state.swap(HealthState::Healthy as u8, Ordering::AcqRel);
        if previous == HealthState::Healthy as u8 {
            return false;
        }
        *self.probe.lock() = ProbeSchedule::default();
        metrics::record_server_health(&self.addr, true);

        let recovered = previous == HealthState::Unhealthy as u8;
        if recovered {
            tracing::info!(server = %self.addr, "Server recovered");
        }
        recovered
    }

    /// Report a failed request. Returns true if this failure crossed the
    /// threshold and made the server unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: u32) -> bool {
        self.consecutive_successes.store(0, Ordering::Relaxed);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;

        if failures >= unhealthy_threshold {
            self.mark_unhealthy("consecutive failures")
        } else {
            false
        }
    }

    /// Force the server unhealthy. Returns false if it already was.
    pub fn mark_unhealthy(&self, cause: &'static str) -> bool {
        let previous = self.state.swap(HealthState::Unhealthy as u8, Ordering::AcqRel);
        if previous == HealthState::Unhealthy as u8 {
            return false;
        }
        *self.probe.lock() = ProbeSchedule::default();
        metrics::record_server_health(&self.addr, false);
        tracing::warn!(
            server = %self.addr,
            cause,
            failures = self.consecutive_failures(),
            "Server marked unhealthy"
        );
        true
    }

    // --- Probe scheduling ---

    /// Whether an unhealthy server is due for a probe at `now`.
    pub fn probe_due(&self, now: Instant) -> bool {
        if self.health() != HealthState::Unhealthy {
            return false;
        }
        match self.probe.lock().next_probe_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Record a failed probe and schedule the next one. Returns the delay.
    pub fn record_probe_failure(&self, now: Instant, backoff: &Backoff) -> Duration {
        let mut probe = self.probe.lock();
        probe.attempts = probe.attempts.saturating_add(1);
        probe.last_probe_at = Some(now);
        let delay = backoff.delay(probe.attempts);
        probe.next_probe_at = Some(now + delay);
        delay
    }

    pub fn probe_attempts(&self) -> u32 {
        self.probe.lock().attempts
    }

    /// Point-in-time view for introspection.
    pub fn snapshot(&self, now: Instant) -> ServerHealth {
        let probe = self.probe.lock();
        ServerHealth {
            address: self.addr.clone(),
            state: self.health(),
            consecutive_failures: self.consecutive_failures(),
            in_flight: self.in_flight(),
            probe_attempts: probe.attempts,
            last_probe_ms_ago: probe
                .last_probe_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            next_probe_in_ms: probe
                .next_probe_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

/// Health snapshot of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub address: ServerAddress,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub in_flight: usize,
    pub probe_attempts: u32,
    pub last_probe_ms_ago: Option<u64>,
    pub next_probe_in_ms: Option<u64>,
}

/// A RAII guard that manages the in-flight request count.
#[derive(Debug)]
pub struct InFlightGuard {
    server: Arc<ServerNode>,
}

impl Deref for InFlightGuard {
    type Target = ServerNode;
    fn deref(&self) -> &Self::Target {
        &self.server
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.server.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Arc<ServerNode> {
        Arc::new(ServerNode::new("127.0.0.1:7400".parse().unwrap()))
    }

    #[test]
    fn starts_unknown_and_selectable() {
        let n = node();
        assert_eq!(n.health(), HealthState::Unknown);
        assert!(n.is_healthy());
        assert!(!n.probe_due(Instant::now()));
    }

    #[test]
    fn failures_cross_threshold() {
        let n = node();
        assert!(!n.mark_failure(3));
        assert!(!n.mark_failure(3));
        assert!(n.mark_failure(3));
        assert!(!n.is_healthy());
        assert!(!n.mark_failure(3));
    }

    #[test]
    fn success_resets_failures() {
        let n = node();
        n.mark_failure(3);
        n.mark_failure(3);
        assert!(!n.mark_success());
        assert_eq!(n.consecutive_failures(), 0);
        assert!(!n.mark_failure(3));
        assert!(n.is_healthy());
    }

    #[test]
    fn probe_schedule_backs_off() {
        let n = node();
        n.mark_unhealthy("test");
        let now = Instant::now();
        assert!(n.probe_due(now));

        let backoff = Backoff::from_millis(1_000, 4_000);
        let d1 = n.record_probe_failure(now, &backoff);
        assert!(d1 >= Duration::from_millis(1_000));
        assert!(!n.probe_due(now));
        assert!(n.probe_due(now + Duration::from_millis(1_200)));

        n.record_probe_failure(now, &backoff);
        let d3 = n.record_probe_failure(now, &backoff);
        assert!(d3 >= Duration::from_millis(4_000) && d3 < Duration::from_millis(4_400));
        assert_eq!(n.probe_attempts(), 3);

        assert!(n.mark_success());
        assert_eq!(n.probe_attempts(), 0);
        assert!(!n.probe_due(now + Duration::from_secs(60)));
    }

    #[test]
    fn in_flight_guard() {
        let n = node();
        let g1 = n.begin_request();
        let g2 = n.begin_request();
        assert_eq!(n.in_flight(), 2);
        drop(g1);
        assert_eq!(g2.in_flight(), 1);
        drop(g2);
        assert_eq!(n.in_flight(), 0);
    }

    #[test]
    fn snapshot_reports_state() {
        let n = node();
        n.mark_unhealthy("test");
        n.record_probe_failure(Instant::now(), &Backoff::from_millis(1_000, 1_000));
        let snap = n.snapshot(Instant::now());
        assert_eq!(snap.state, HealthState::Unhealthy);
        assert_eq!(snap.probe_attempts, 1);
        assert!(snap.next_probe_in_ms.is_some());
    }
}
