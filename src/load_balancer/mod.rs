//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! send_request
//!     → Balancer::select()
//!         healthy servers (Healthy or Unknown), or every server if none are
//!     → Apply load balancing algorithm:
//!         - random.rs (uniform pick, default)
//!         - round_robin.rs (rotate through servers)
//!         - least_conn.rs (pick server with fewest requests in flight)
//!     → pool for the chosen ServerNode
//!
//! failover
//!     → Balancer::select_excluding(tried)
//!         healthy untried → any untried → none
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless with respect to health; Balancer filters first
//! - Unhealthy servers are deprioritized, never removed
//! - Server set is fixed for the lifetime of a client

pub mod least_conn;
pub mod random;
pub mod round_robin;
pub mod server;

use std::sync::Arc;
use std::time::Instant;

use crate::config::LoadBalanceStrategy;
use crate::net::address::ServerAddress;

pub use server::{InFlightGuard, ServerHealth, ServerNode};

/// A server selection algorithm.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    /// Pick one of `servers`, or None if the slice is empty.
    fn next_server(&self, servers: &[Arc<ServerNode>]) -> Option<Arc<ServerNode>>;
}

/// Build the selector for a configured strategy.
pub fn strategy(kind: LoadBalanceStrategy) -> Box<dyn LoadBalancer> {
    match kind {
        LoadBalanceStrategy::Random => Box::new(random::Random::new()),
        LoadBalanceStrategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        LoadBalanceStrategy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
    }
}

/// The client's server set plus its selection strategy.
#[derive(Debug)]
pub struct Balancer {
    servers: Vec<Arc<ServerNode>>,
    strategy: Box<dyn LoadBalancer>,
}

impl Balancer {
    pub fn new(addresses: &[ServerAddress], kind: LoadBalanceStrategy) -> Self {
        Self {
            servers: addresses
                .iter()
                .map(|addr| Arc::new(ServerNode::new(addr.clone())))
                .collect(),
            strategy: strategy(kind),
        }
    }

    pub fn servers(&self) -> &[Arc<ServerNode>] {
        &self.servers
    }

    pub fn get(&self, addr: &ServerAddress) -> Option<&Arc<ServerNode>> {
        self.servers.iter().find(|s| s.addr() == addr)
    }

    /// Pick a server, preferring healthy ones.
    pub fn select(&self) -> Option<Arc<ServerNode>> {
        let healthy: Vec<Arc<ServerNode>> =
            self.servers.iter().filter(|s| s.is_healthy()).cloned().collect();
        if healthy.is_empty() {
            self.strategy.next_server(&self.servers)
        } else {
            self.strategy.next_server(&healthy)
        }
    }

    /// Pick a server not in `tried`, preferring healthy ones.
    pub fn select_excluding(&self, tried: &[ServerAddress]) -> Option<Arc<ServerNode>> {
        let untried: Vec<Arc<ServerNode>> = self
            .servers
            .iter()
            .filter(|s| !tried.contains(s.addr()))
            .cloned()
            .collect();
        let healthy: Vec<Arc<ServerNode>> =
            untried.iter().filter(|s| s.is_healthy()).cloned().collect();
        if healthy.is_empty() {
            self.strategy.next_server(&untried)
        } else {
            self.strategy.next_server(&healthy)
        }
    }

    /// Health snapshot for every server, in configuration order.
    pub fn health(&self) -> Vec<ServerHealth> {
        let now = Instant::now();
        self.servers.iter().map(|s| s.snapshot(now)).collect()
    }
}
