//! Background health sweep.
//!
//! # Responsibilities
//! - Reclaim connections that sit idle
//! - Mark servers unhealthy when their connections go stale
//! - Probe unhealthy servers with capped exponential backoff
//! - Expire requests whose deadline passed without a response

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthConfig;
use crate::error::{ClientError, CloseReason};
use crate::load_balancer::{Balancer, ServerNode};
use crate::net::address::ServerAddress;
use crate::net::connection::{ConnectSettings, Connection};
use crate::observability::metrics;
use crate::pool::PoolRegistry;
use crate::resilience::backoff::Backoff;

/// Totals for one sweep, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub closed_idle: usize,
    pub marked_unhealthy: usize,
    pub expired_requests: usize,
    pub probes: usize,
    pub recovered: usize,
}

/// Connect (and handshake, when credentials are set) within `timeout`.
pub async fn probe_server(
    server: &ServerAddress,
    settings: &ConnectSettings,
    timeout: Duration,
) -> Result<(), ClientError> {
    let settings = ConnectSettings {
        connect_timeout: timeout,
        ..settings.clone()
    };
    let conn = match time::timeout(timeout, Connection::open(server, &settings, None)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ClientError::transport(
                server,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timed out"),
            ))
        }
    };
    conn.close(CloseReason::Explicit);
    Ok(())
}

pub struct HealthMonitor {
    balancer: Arc<Balancer>,
    pools: Arc<PoolRegistry>,
    config: HealthConfig,
    connect: ConnectSettings,
    backoff: Backoff,
}

impl HealthMonitor {
    pub fn new(
        balancer: Arc<Balancer>,
        pools: Arc<PoolRegistry>,
        config: HealthConfig,
        connect: ConnectSettings,
    ) -> Self {
        let backoff = Backoff::from_millis(config.probe_interval_millis, config.max_probe_interval_millis);
        Self {
            balancer,
            pools,
            config,
            connect,
            backoff,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Health monitor disabled");
            return;
        }

        tracing::info!(
            interval_ms = self.config.sweep_interval_millis,
            idle_close_ms = self.config.idle_close_threshold_millis,
            unhealthy_ms = self.config.unhealthy_threshold_millis,
            "Health monitor starting"
        );

        let interval = self.config.sweep_interval();
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        tracing::debug!(?report, "Health sweep finished");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Run one sweep over every pool and server.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = Instant::now();
        // Servers marked here get their first probe on the next sweep.
        let mut just_marked: Vec<ServerAddress> = Vec::new();

        for pool in self.pools.pools() {
            let outcome = pool.sweep(
                now,
                self.config.idle_close_threshold(),
                self.config.unhealthy_threshold(),
            );
            report.closed_idle += outcome.closed_idle;
            report.marked_unhealthy += outcome.marked_unhealthy;
            report.expired_requests += outcome.expired_requests;

            if outcome.marked_unhealthy > 0 {
                if let Some(server) = self.balancer.get(pool.server()) {
                    if server.mark_unhealthy("stale connection") {
                        just_marked.push(server.addr().clone());
                    }
                }
            }
            metrics::record_pool(pool.server(), &pool.stats());
        }

        for server in self.balancer.servers() {
            if server.probe_due(now) && !just_marked.contains(server.addr()) {
                report.probes += 1;
                if self.probe(server).await {
                    report.recovered += 1;
                }
            }
        }
        report
    }

    async fn probe(&self, server: &ServerNode) -> bool {
        let result = probe_server(server.addr(), &self.connect, self.config.probe_timeout()).await;
        metrics::record_probe(server.addr(), result.is_ok());

        match result {
            Ok(()) => {
                server.mark_success();
                true
            }
            Err(e) => {
                let delay = server.record_probe_failure(Instant::now(), &self.backoff);
                tracing::warn!(
                    server = %server.addr(),
                    error = %e,
                    attempts = server.probe_attempts(),
                    next_probe_ms = delay.as_millis() as u64,
                    "Probe failed"
                );
                false
            }
        }
    }
}
