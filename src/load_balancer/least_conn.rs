//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{server::ServerNode, LoadBalancer};

/// Least connections selector.
/// Selects the server with the fewest requests in flight.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, servers: &[Arc<ServerNode>]) -> Option<Arc<ServerNode>> {
        // Ties go to the first server (stability)
        servers.iter().min_by_key(|s| s.in_flight()).cloned()
    }
}
