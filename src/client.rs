//! Client facade.
//!
//! # Responsibilities
//! - Validate config and build the balancer, pools and health monitor
//! - Route each request: select server → acquire connection → dispatch →
//!   await response or deadline
//! - Fail over once on connection-level failures
//! - Feed outcomes into passive health and metrics
//! - Close everything exactly once

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{validate_config, ClientConfig};
use crate::error::{ClientError, CloseReason, Result};
use crate::health::{HealthMonitor, PassiveHealth};
use crate::lifecycle::Shutdown;
use crate::load_balancer::{Balancer, ServerHealth, ServerNode};
use crate::net::address::ServerAddress;
use crate::net::connection::Connection;
use crate::net::message::RequestId;
use crate::observability::metrics;
use crate::pool::{PoolRegistry, PoolSettings, PoolStats};
use crate::resilience::FailoverPolicy;

/// Handle to a cluster client. Cheap to clone; the last handle dropped
/// closes the client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: Uuid,
    config: ClientConfig,
    balancer: Arc<Balancer>,
    pools: Arc<PoolRegistry>,
    passive: PassiveHealth,
    failover: FailoverPolicy,
    shutdown: Shutdown,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    next_request_id: AtomicU64,
}

impl Client {
    /// Build a client. Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        validate_config(&config).map_err(ClientError::InvalidConfig)?;

        let id = Uuid::new_v4();
        let balancer = Arc::new(Balancer::new(
            &config.server_addresses,
            config.load_balance_strategy,
        ));
        let pools = Arc::new(PoolRegistry::with_servers(
            &config.server_addresses,
            PoolSettings::from_config(&config),
        ));
        let shutdown = Shutdown::new();

        let monitor = if config.health.enabled {
            let monitor = HealthMonitor::new(
                balancer.clone(),
                pools.clone(),
                config.health.clone(),
                config.connect_settings(),
            );
            Some(tokio::spawn(monitor.run(shutdown.subscribe())))
        } else {
            None
        };

        tracing::info!(
            client_id = %id,
            servers = config.server_addresses.len(),
            strategy = ?config.load_balance_strategy,
            max_pool_size = config.connection.max_pool_size,
            "Client started"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                passive: PassiveHealth::new(config.health.unhealthy_failure_threshold),
                failover: FailoverPolicy::new(config.failover),
                config,
                balancer,
                pools,
                shutdown,
                monitor: Mutex::new(monitor),
                closed: AtomicBool::new(false),
                next_request_id: AtomicU64::new(1),
            }),
        })
    }

    /// Unique id of this client instance, used in logs.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send `payload` and decode the response with `decoder`, using the
    /// configured `handle_timeout_millis` as the response deadline.
    pub async fn send<T, E, D>(&self, payload: &[u8], decoder: D) -> Result<T>
    where
        T: Send + 'static,
        E: std::fmt::Display + 'static,
        D: FnOnce(Bytes) -> std::result::Result<T, E> + Clone + Send + 'static,
    {
        self.send_request(payload, decoder, self.inner.config.handle_timeout())
            .await
    }

    /// Send `payload` to a selected server and decode its response.
    ///
    /// `timeout` bounds the wait for the response once the request is
    /// written; acquiring a connection is bounded separately by
    /// `acquire_timeout_millis`. The decoder must be `Clone` so it can be
    /// reused if the request fails over.
    pub async fn send_request<T, E, D>(&self, payload: &[u8], decoder: D, timeout: Duration) -> Result<T>
    where
        T: Send + 'static,
        E: std::fmt::Display + 'static,
        D: FnOnce(Bytes) -> std::result::Result<T, E> + Clone + Send + 'static,
    {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }

        let mut tried: Vec<ServerAddress> = Vec::new();
        let mut attempts = 0;
        loop {
            attempts += 1;

            let selected = if tried.is_empty() {
                self.inner.balancer.select()
            } else {
                self.inner.balancer.select_excluding(&tried)
            };
            let Some(server) = selected else {
                return Err(ClientError::NoServerAvailable);
            };

            let start = Instant::now();
            let result = self.attempt(&server, payload, decoder.clone(), timeout).await;
            metrics::record_request(server.addr(), outcome_label(&result), start);
            self.inner.passive.observe(&server, &result);

            match result {
                Err(e) if self.inner.failover.should_retry(attempts, &e) && !self.is_closed() => {
                    tracing::warn!(
                        client_id = %self.inner.id,
                        server = %server.addr(),
                        attempt = attempts,
                        error = %e,
                        "Request failed, failing over"
                    );
                    tried.push(server.addr().clone());
                    if self.inner.balancer.select_excluding(&tried).is_none() {
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    async fn attempt<T, E, D>(
        &self,
        server: &Arc<ServerNode>,
        payload: &[u8],
        decoder: D,
        timeout: Duration,
    ) -> Result<T>
    where
        T: Send + 'static,
        E: std::fmt::Display + 'static,
        D: FnOnce(Bytes) -> std::result::Result<T, E> + Send + 'static,
    {
        let pool = self
            .inner
            .pools
            .get(server.addr())
            .ok_or(ClientError::NoServerAvailable)?;
        let _in_flight = server.begin_request();

        let conn = pool.get().await?;
        let id = self.next_request_id();
        let deadline = Instant::now() + timeout;
        let mut rx = conn.dispatch(id, payload, decoder, deadline)?;
        let mut pending = PendingSlot {
            conn: conn.connection(),
            id,
            armed: true,
        };

        let result = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionClosed {
                server: server.addr().clone(),
                reason: CloseReason::Shutdown,
            }),
            Err(_) => {
                conn.correlator().on_timeout(id);
                // A response racing the deadline wins.
                rx.try_recv().unwrap_or(Err(ClientError::RequestTimeout {
                    server: server.addr().clone(),
                    id,
                    after: timeout,
                }))
            }
        };
        pending.armed = false;
        result
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Close every pool and stop the health monitor. Idempotent; does not wait
    /// for in-flight requests, which fail with `ConnectionClosed`.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Connections currently checked out (or awaiting reclamation).
    pub fn active_connection_count(&self) -> usize {
        self.pool_stats().active
    }

    pub fn idle_connection_count(&self) -> usize {
        self.pool_stats().idle
    }

    pub fn total_connection_count(&self) -> usize {
        self.pool_stats().total
    }

    /// Combined pool stats across every server.
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pools.stats()
    }

    /// Stats for one server's pool.
    pub fn server_pool_stats(&self, server: &ServerAddress) -> Option<PoolStats> {
        self.inner.pools.get(server).map(|pool| pool.stats())
    }

    /// Health snapshot for every configured server.
    pub fn server_health(&self) -> Vec<ServerHealth> {
        self.inner.balancer.health()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("servers", &self.inner.config.server_addresses)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.trigger();
        if let Some(handle) = self.monitor.lock().take() {
            handle.abort();
        }
        self.pools.close_all();
        tracing::info!(client_id = %self.id, "Client closed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Abandons the request's correlator slot if the caller stops waiting.
struct PendingSlot<'a> {
    conn: &'a Connection,
    id: RequestId,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.correlator().abandon(self.id);
        }
    }
}

fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(ClientError::RequestTimeout { .. }) => "timeout",
        Err(ClientError::PoolExhausted { .. }) | Err(ClientError::AcquireTimeout { .. }) => "capacity",
        Err(ClientError::Decode(_)) => "decode_error",
        Err(ClientError::RequestTooLarge { .. }) => "rejected",
        Err(_) => "error",
    }
}
