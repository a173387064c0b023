use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fabric_common::protocol::error::Result;
use fabric_common::HostDescription;

use crate::connection::ConnectionFactory;
use crate::pool::{ConnectionPool, ManagedConnection, PoolConfig, PoolStats};

/// One cluster endpoint and its connection pool.
///
/// Hosts are shared as `Arc<Host>`; two handles are the same host when they
/// point at the same allocation. The directory keeps a host's `Arc` stable
/// across refreshes for as long as the endpoint keeps being reported.
pub struct Host {
    description: HostDescription,
    pool: Arc<ConnectionPool>,
    marked_for_deletion: AtomicBool,
}

impl Host {
    pub fn new(
        description: HostDescription,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(description.clone(), config, factory));
        Self {
            description,
            pool,
            marked_for_deletion: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &HostDescription {
        &self.description
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<ManagedConnection> {
        self.pool.acquire().await
    }

    pub async fn acquire_with_timeout(&self, timeout: Option<Duration>) -> Result<ManagedConnection> {
        self.pool.acquire_with_timeout(timeout).await
    }

    pub fn set_marked_for_deletion(&self, marked: bool) {
        self.marked_for_deletion.store(marked, Ordering::SeqCst);
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::SeqCst)
    }

    /// Closes the pool; fails while connections are checked out.
    pub fn close(&self) -> Result<()> {
        self.pool.close()
    }

    /// Closes idle connections now and the rest as they come back.
    pub fn retire(&self) {
        self.pool.drain();
    }

    pub fn close_idle(&self) -> usize {
        self.pool.close_idle()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("description", &self.description)
            .field("marked_for_deletion", &self.is_marked_for_deletion())
            .finish()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// Builds hosts with a shared pool configuration and connection factory.
#[derive(Clone)]
pub struct HostFactory {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
}

impl HostFactory {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { config, factory }
    }

    pub fn create(&self, description: HostDescription) -> Arc<Host> {
        Arc::new(Host::new(description, self.config.clone(), self.factory.clone()))
    }
}
