use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info, warn};

use crate::connection::{Connection, ConnectionFactory};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};

/// Named connection pools, built once at startup.
pub struct DatabaseManager {
    pools: HashMap<String, Arc<ConnectionPool>>,
    shut_down: AtomicBool,
}

impl DatabaseManager {
    /// Build one pool per entry. A pool that fails to initialize is logged
    /// and left out.
    pub fn initialize(configs: &[(String, PoolConfig)], factory: Arc<dyn ConnectionFactory>) -> Self {
        let mut pools = HashMap::with_capacity(configs.len());
        for (name, config) in configs {
            match ConnectionPool::initialize(name, config.clone(), Arc::clone(&factory)) {
                Ok(pool) => {
                    pools.insert(name.clone(), pool);
                }
                Err(e) => error!(pool = %name, "Failed to initialize connection pool: {}", e),
            }
        }
        info!(pools = pools.len(), requested = configs.len(), "Database manager initialized");
        Self {
            pools,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn pool(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).cloned()
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    pub fn pool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn get_connection(&self, name: &str) -> Option<Connection> {
        let pool = self.known(name)?;
        match pool.acquire() {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(pool = %name, "Could not get connection: {}", e);
                None
            }
        }
    }

    pub fn return_connection(&self, name: &str, conn: Connection) {
        if let Some(pool) = self.known(name) {
            pool.release(conn);
        }
    }

    pub fn pool_size(&self, name: &str) -> Option<usize> {
        self.known(name).map(|p| p.pool_size())
    }

    pub fn active_connections(&self, name: &str) -> Option<usize> {
        self.known(name).map(|p| p.active_connections())
    }

    pub fn idle_connections(&self, name: &str) -> Option<usize> {
        self.known(name).map(|p| p.idle_connections())
    }

    pub fn set_pool_size(&self, name: &str, size: usize) -> bool {
        self.known(name).is_some_and(|p| p.set_pool_size(size))
    }

    pub fn increase_pool_size(&self, name: &str, delta: usize) -> bool {
        self.known(name).is_some_and(|p| p.increase_pool_size(delta))
    }

    pub fn decrease_pool_size(&self, name: &str, delta: usize) -> bool {
        self.known(name).is_some_and(|p| p.decrease_pool_size(delta))
    }

    pub fn resize_pool(&self, name: &str, size: usize) -> bool {
        self.known(name).is_some_and(|p| p.resize_pool(size))
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.values().map(|p| p.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Shut every pool down. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for pool in self.pools.values() {
            pool.shutdown();
        }
        info!("Database manager shut down");
    }

    fn known(&self, name: &str) -> Option<&Arc<ConnectionPool>> {
        let pool = self.pools.get(name);
        if pool.is_none() {
            warn!(pool = %name, "Unknown database pool");
        }
        pool
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
