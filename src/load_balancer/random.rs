//! Uniform random load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{server::ServerNode, LoadBalancer};

#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Random {
    fn next_server(&self, servers: &[Arc<ServerNode>]) -> Option<Arc<ServerNode>> {
        if servers.is_empty() {
            return None;
        }
        Some(servers[fastrand::usize(..servers.len())].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn picks_every_server_eventually() {
        let lb = Random::new();
        let servers: Vec<_> = (0..3)
            .map(|i| Arc::new(ServerNode::new(format!("127.0.0.1:{}", 7400 + i).parse().unwrap())))
            .collect();

        let mut seen = HashSet::new();
        for _ in 0..500 {
            seen.insert(lb.next_server(&servers).unwrap().addr().clone());
        }
        assert_eq!(seen.len(), 3);
    }
}
