//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::address::ServerAddress;
use crate::net::connection::ConnectSettings;
use crate::net::frame::DEFAULT_MAX_FRAME_LENGTH;
use crate::net::handshake::Credentials;

/// Root configuration for a client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate servers. All are equally capable.
    pub server_addresses: Vec<ServerAddress>,

    /// Server selection strategy.
    pub load_balance_strategy: LoadBalanceStrategy,

    /// Default per-request deadline in milliseconds.
    pub handle_timeout_millis: u64,

    /// Retry once on another server after a connection-level failure.
    pub failover: bool,

    /// Handshake username. Enables the handshake when set.
    pub username: Option<String>,

    /// Handshake password.
    pub password: Option<String>,

    /// Per-server pool settings.
    pub connection: ConnectionConfig,

    /// Health monitor settings.
    pub health: HealthConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addresses: Vec::new(),
            load_balance_strategy: LoadBalanceStrategy::default(),
            handle_timeout_millis: 10_000,
            failover: true,
            username: None,
            password: None,
            connection: ConnectionConfig::default(),
            health: HealthConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Config with the given servers and defaults everywhere else.
    pub fn with_servers(servers: impl IntoIterator<Item = ServerAddress>) -> Self {
        Self {
            server_addresses: servers.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn handle_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_timeout_millis)
    }

    /// Handshake credentials, if a username is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    /// Settings used whenever a connection (or probe) is opened.
    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            connect_timeout: Duration::from_millis(self.connection.connect_timeout_millis),
            max_frame_length: self.connection.max_frame_length,
            credentials: self.credentials(),
        }
    }
}

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Uniform random among healthy servers.
    #[default]
    Random,
    /// Rotate through healthy servers.
    RoundRobin,
    /// Healthy server with the fewest requests in flight.
    LeastConnections,
}

/// Per-server connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hard cap on connections per server.
    pub max_pool_size: usize,

    /// Maximum time to wait for a connection, in milliseconds.
    pub acquire_timeout_millis: u64,

    /// Queued acquirers allowed before failing fast.
    pub max_pending_acquires: usize,

    /// TCP connect + handshake timeout, in milliseconds.
    pub connect_timeout_millis: u64,

    /// Largest accepted frame payload, in bytes.
    pub max_frame_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 8,
            acquire_timeout_millis: 5_000,
            max_pending_acquires: 256,
            connect_timeout_millis: 3_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ConnectionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_millis)
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Run the background sweep.
    pub enabled: bool,

    /// Interval between sweeps, in milliseconds.
    pub sweep_interval_millis: u64,

    /// Ready connections idle longer than this are closed.
    pub idle_close_threshold_millis: u64,

    /// Ready connections idle longer than this mark their server unhealthy.
    pub unhealthy_threshold_millis: u64,

    /// Base delay between probes of an unhealthy server.
    pub probe_interval_millis: u64,

    /// Cap on the probe backoff.
    pub max_probe_interval_millis: u64,

    /// Timeout for a single probe (connect + handshake).
    pub probe_timeout_millis: u64,

    /// Consecutive request failures before a server is marked unhealthy.
    pub unhealthy_failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_millis: 5_000,
            idle_close_threshold_millis: 30_000,
            unhealthy_threshold_millis: 60_000,
            probe_interval_millis: 10_000,
            max_probe_interval_millis: 300_000,
            probe_timeout_millis: 3_000,
            unhealthy_failure_threshold: 3,
        }
    }
}

impl HealthConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_millis)
    }

    pub fn idle_close_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_close_threshold_millis)
    }

    pub fn unhealthy_threshold(&self) -> Duration {
        Duration::from_millis(self.unhealthy_threshold_millis)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_millis)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Install the Prometheus exporter (binaries only).
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
