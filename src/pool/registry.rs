//! Per-client registry of pools, keyed by server address.

use std::sync::Arc;

use dashmap::DashMap;

use crate::net::address::ServerAddress;
use crate::pool::connection_pool::{ConnectionPool, PoolSettings, PoolStats};

/// Owns one `ConnectionPool` per server. Each client has its own registry,
/// so pools are never shared between clients.
#[derive(Debug)]
pub struct PoolRegistry {
    pools: DashMap<ServerAddress, Arc<ConnectionPool>>,
    settings: PoolSettings,
}

impl PoolRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
        }
    }

    /// Registry with a pool already created for each address.
    pub fn with_servers<'a>(
        servers: impl IntoIterator<Item = &'a ServerAddress>,
        settings: PoolSettings,
    ) -> Self {
        let registry = Self::new(settings);
        for server in servers {
            registry.get_or_create(server);
        }
        registry
    }

    pub fn get(&self, server: &ServerAddress) -> Option<Arc<ConnectionPool>> {
        self.pools.get(server).map(|entry| entry.value().clone())
    }

    pub fn get_or_create(&self, server: &ServerAddress) -> Arc<ConnectionPool> {
        self.pools
            .entry(server.clone())
            .or_insert_with(|| ConnectionPool::new(server.clone(), self.settings.clone()))
            .value()
            .clone()
    }

    /// Snapshot of every pool. Entries are cloned out so no shard lock is
    /// held while the caller works with them.
    pub fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Combined stats across every pool.
    pub fn stats(&self) -> PoolStats {
        self.pools()
            .iter()
            .fold(PoolStats::default(), |acc, pool| acc + pool.stats())
    }

    /// Close every pool and drop them from the registry.
    pub fn close_all(&self) {
        let pools = self.pools();
        self.pools.clear();
        for pool in pools {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_pool_per_address() {
        let a: ServerAddress = "127.0.0.1:7400".parse().unwrap();
        let b: ServerAddress = "127.0.0.1:7401".parse().unwrap();
        let registry = PoolRegistry::with_servers([&a, &b], PoolSettings::default());
        assert_eq!(registry.len(), 2);

        let again = registry.get_or_create(&a);
        assert!(Arc::ptr_eq(&again, &registry.get(&a).unwrap()));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let a: ServerAddress = "127.0.0.1:7400".parse().unwrap();
        let registry = PoolRegistry::with_servers([&a], PoolSettings::default());
        let pool = registry.get(&a).unwrap();

        registry.close_all();
        assert!(registry.is_empty());
        assert!(pool.is_closed());
        assert_eq!(registry.stats(), PoolStats::default());
    }
}
