//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{server::ServerNode, LoadBalancer};

/// Round-robin selector.
/// Stores an internal counter to rotate through servers.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, servers: &[Arc<ServerNode>]) -> Option<Arc<ServerNode>> {
        if servers.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % servers.len();
        Some(servers[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        let s1 = Arc::new(ServerNode::new("127.0.0.1:7400".parse().unwrap()));
        let s2 = Arc::new(ServerNode::new("127.0.0.1:7401".parse().unwrap()));
        let servers = vec![s1.clone(), s2.clone()];

        assert_eq!(lb.next_server(&servers).unwrap().addr(), s1.addr());
        assert_eq!(lb.next_server(&servers).unwrap().addr(), s2.addr());
        assert_eq!(lb.next_server(&servers).unwrap().addr(), s1.addr());
    }

    #[test]
    fn empty_yields_none() {
        assert!(RoundRobin::new().next_server(&[]).is_none());
    }
}
