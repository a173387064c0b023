use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::HostDescription;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionFactory};

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `max_connections`: 20
/// - `acquire_timeout_ms`: 30000 (30 seconds, 0 waits forever)
/// - `connection_ttl_ms`: none (connections live until they fail)
///
/// # Example
///
/// ```rust
/// use fabric_client::PoolConfig;
///
/// let config = PoolConfig {
///     max_connections: 4,
///     acquire_timeout_ms: 500,
///     connection_ttl_ms: Some(60_000),
/// };
/// assert_eq!(config.acquire_timeout(), Some(std::time::Duration::from_millis(500)));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections to one host
    pub max_connections: usize,
    /// Maximum time to wait for a connection in milliseconds
    pub acquire_timeout_ms: u64,
    /// Connections older than this are closed instead of reused
    pub connection_ttl_ms: Option<u64>,
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_ms > 0).then(|| Duration::from_millis(self.acquire_timeout_ms))
    }

    fn connection_ttl(&self) -> Option<Duration> {
        self.connection_ttl_ms.map(Duration::from_millis)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout_ms: 30000, // 30 seconds
            connection_ttl_ms: None,
        }
    }
}

/// Snapshot of a pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub creating: usize,
    pub waiters: usize,
    pub max: usize,
}

/// What a waiter receives from the pool.
enum Handoff {
    /// A connection, already registered as checked out
    Connection(Arc<dyn Connection>),
    /// A creation slot, already counted in `creating`
    Reserved,
}

impl Handoff {
    fn into_connection(self) -> Option<Arc<dyn Connection>> {
        match self {
            Handoff::Connection(connection) => Some(connection),
            Handoff::Reserved => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    /// No new checkouts; checked-out connections are closed on dispose
    Draining,
    Closed,
}

struct PoolState {
    /// Idle connections, most recently used last
    free: Vec<Arc<dyn Connection>>,
    checked_out: HashMap<u64, Arc<dyn Connection>>,
    /// Connections being established outside the lock
    creating: usize,
    waiters: VecDeque<oneshot::Sender<Handoff>>,
    lifecycle: Lifecycle,
    /// Last idle connection handed out by `acquire_shared`
    cursor: usize,
}

enum Next {
    Ready(Arc<dyn Connection>),
    Create,
    Wait(oneshot::Receiver<Handoff>),
}

/// Bounded connection pool for one host.
///
/// Idle connections are reused LIFO. When the pool is at `max_connections`,
/// callers queue FIFO and a disposed connection is handed directly to the
/// oldest waiter still listening; waiters that gave up are skipped.
///
/// All state lives behind one mutex that is never held across an `.await`.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use fabric_client::{ConnectionPool, HttpConnectionFactory, PoolConfig};
/// use fabric_common::HostDescription;
/// use fabric_common::transport::TcpTransport;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = Arc::new(HttpConnectionFactory::new(TcpTransport::default(), None));
/// let host = HostDescription::parse("127.0.0.1:8529")?;
/// let pool = Arc::new(ConnectionPool::new(host, PoolConfig::default(), factory));
///
/// let connection = pool.acquire().await?;
/// // ... use connection.connection() ...
/// connection.dispose()?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    host: HostDescription,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(
        host: HostDescription,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            host,
            config,
            factory,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                checked_out: HashMap::new(),
                creating: 0,
                waiters: VecDeque::new(),
                lifecycle: Lifecycle::Open,
                cursor: 0,
            }),
        }
    }

    pub fn host(&self) -> &HostDescription {
        &self.host
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquires a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<ManagedConnection> {
        self.acquire_with_timeout(self.config.acquire_timeout()).await
    }

    /// Acquires a connection, waiting at most `timeout` (`None` waits forever).
    ///
    /// # Errors
    ///
    /// - `PoolTimeout` if no connection became available in time
    /// - `PoolClosed` if the pool is closed or draining
    /// - any error from establishing a new connection
    pub async fn acquire_with_timeout(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<ManagedConnection> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let next = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Open {
                return Err(FabricError::PoolClosed(self.host.to_string()));
            }
            self.take_idle(&mut state)
        };

        let rx = match next {
            Next::Ready(connection) => return Ok(self.managed(connection)),
            Next::Create => return self.create_reserved().await,
            Next::Wait(rx) => rx,
        };

        tracing::debug!(host = %self.host, "Pool exhausted, waiting for a connection");
        let mut waiter = Waiter { pool: self, rx };

        let received = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, &mut waiter.rx).await {
                Ok(received) => received,
                Err(_) => {
                    // A hand-off may have raced the deadline
                    if let Some(connection) = waiter.settle() {
                        return Ok(self.managed(connection));
                    }
                    let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                    tracing::debug!(host = %self.host, ms, "Timed out waiting for a connection");
                    return Err(FabricError::PoolTimeout {
                        host: self.host.to_string(),
                        ms,
                    });
                }
            },
            None => (&mut waiter.rx).await,
        };
        drop(waiter);

        match received {
            Ok(Handoff::Connection(connection)) => Ok(self.managed(connection)),
            Ok(Handoff::Reserved) => self.create_reserved().await,
            // Sender dropped: the pool was closed while we waited
            Err(_) => Err(FabricError::PoolClosed(self.host.to_string())),
        }
    }

    /// Picks a connection for a multiplexed protocol without checking it out.
    ///
    /// While the pool is below `max_connections` every call opens a new
    /// connection; after that, calls rotate over the idle ones. Falls back to
    /// a regular acquire when every connection is checked out.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionPool::acquire_with_timeout`].
    pub async fn acquire_shared(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn Connection>> {
        let create = {
            let mut state = self.lock();
            if state.lifecycle != Lifecycle::Open {
                return Err(FabricError::PoolClosed(self.host.to_string()));
            }
            self.prune_idle(&mut state);

            let open = state.free.len() + state.checked_out.len() + state.creating;
            if open < self.config.max_connections {
                state.creating += 1;
                true
            } else if !state.free.is_empty() {
                state.cursor = (state.cursor + 1) % state.free.len();
                return Ok(state.free[state.cursor].clone());
            } else {
                false
            }
        };

        let managed = if create {
            self.create_reserved().await?
        } else {
            self.acquire_with_timeout(timeout).await?
        };
        let connection = managed.connection().clone();
        managed.dispose()?;
        Ok(connection)
    }

    /// Returns a connection to the pool.
    ///
    /// The connection is handed to the oldest live waiter, or parked as idle.
    /// Broken or expired connections are closed and their slot is offered to
    /// a waiter instead.
    ///
    /// # Errors
    ///
    /// `PoolMisuse` if the connection is not checked out from this pool, which
    /// includes disposing the same connection twice.
    pub fn dispose(&self, connection: Arc<dyn Connection>) -> Result<()> {
        let to_close = {
            let mut state = self.lock();
            if state.checked_out.remove(&connection.id()).is_none() {
                return Err(FabricError::PoolMisuse(format!(
                    "connection {} to {} is not checked out",
                    connection.id(),
                    self.host
                )));
            }

            if state.lifecycle != Lifecycle::Open {
                Some(connection)
            } else if connection.is_closed() || self.is_expired(&connection) {
                Self::offer_slot(&mut state);
                Some(connection)
            } else {
                match Self::hand_off(&mut state, connection) {
                    Some(connection) => state.free.push(connection),
                    None => tracing::trace!(host = %self.host, "Handed connection to waiter"),
                }
                None
            }
        };

        if let Some(connection) = to_close {
            tracing::debug!(
                host = %self.host,
                connection = connection.id(),
                "Closing connection on dispose"
            );
            connection.close();
        }
        Ok(())
    }

    /// Closes the pool and every idle connection.
    ///
    /// Queued waiters fail with `PoolClosed`.
    ///
    /// # Errors
    ///
    /// `PoolMisuse` if connections are still checked out; nothing is closed.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            if !state.checked_out.is_empty() {
                return Err(FabricError::PoolMisuse(format!(
                    "closing pool for {} with {} connection(s) checked out",
                    self.host,
                    state.checked_out.len()
                )));
            }
            state.lifecycle = Lifecycle::Closed;
            state.waiters.clear();
            std::mem::take(&mut state.free)
        };

        tracing::debug!(host = %self.host, idle = idle.len(), "Closing connection pool");
        for connection in idle {
            connection.close();
        }
        Ok(())
    }

    /// Stops handing out connections and closes idle ones now.
    ///
    /// Checked-out connections are closed as they are disposed.
    pub fn drain(&self) {
        let idle = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Open {
                state.lifecycle = Lifecycle::Draining;
            }
            state.waiters.clear();
            std::mem::take(&mut state.free)
        };

        tracing::debug!(host = %self.host, idle = idle.len(), "Draining connection pool");
        for connection in idle {
            connection.close();
        }
    }

    /// Closes idle connections, keeping the pool open. Returns how many were closed.
    pub fn close_idle(&self) -> usize {
        let idle = {
            let mut state = self.lock();
            let idle = std::mem::take(&mut state.free);
            // Freed slots may unblock waiters
            for _ in 0..idle.len() {
                Self::offer_slot(&mut state);
            }
            idle
        };

        let closed = idle.len();
        for connection in idle {
            connection.close();
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle != Lifecycle::Open
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            idle: state.free.len(),
            checked_out: state.checked_out.len(),
            creating: state.creating,
            waiters: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            max: self.config.max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // A panic while holding the lock leaves the state consistent
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_idle(&self, state: &mut PoolState) -> Next {
        while let Some(connection) = state.free.pop() {
            if connection.is_closed() || self.is_expired(&connection) {
                tracing::debug!(host = %self.host, connection = connection.id(), "Dropping stale idle connection");
                connection.close();
                continue;
            }
            state.checked_out.insert(connection.id(), connection.clone());
            return Next::Ready(connection);
        }

        if state.checked_out.len() + state.creating < self.config.max_connections {
            state.creating += 1;
            return Next::Create;
        }

        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Next::Wait(rx)
    }

    fn prune_idle(&self, state: &mut PoolState) {
        state.free.retain(|connection| {
            let stale = connection.is_closed() || self.is_expired(connection);
            if stale {
                tracing::debug!(host = %self.host, connection = connection.id(), "Dropping stale idle connection");
                connection.close();
            }
            !stale
        });
    }

    /// Establishes a connection for a slot already counted in `creating`.
    ///
    /// The slot is given back if this future is dropped mid-connect.
    async fn create_reserved(self: &Arc<Self>) -> Result<ManagedConnection> {
        let slot = CreationSlot { pool: self, armed: true };
        let created = self.factory.create(&self.host).await;

        let mut state = slot.release();
        match created {
            Ok(connection) => {
                if state.lifecycle != Lifecycle::Open {
                    drop(state);
                    connection.close();
                    return Err(FabricError::PoolClosed(self.host.to_string()));
                }
                tracing::debug!(host = %self.host, connection = connection.id(), "Opened connection");
                state.checked_out.insert(connection.id(), connection.clone());
                drop(state);
                Ok(self.managed(connection))
            }
            Err(err) => {
                // Let the next waiter try its own connection attempt
                if state.lifecycle == Lifecycle::Open {
                    Self::offer_slot(&mut state);
                }
                Err(err)
            }
        }
    }

    /// Gives back a creation slot that will not be used.
    fn release_slot(&self) {
        let mut state = self.lock();
        state.creating -= 1;
        if state.lifecycle == Lifecycle::Open {
            Self::offer_slot(&mut state);
        }
    }

    /// Hands a connection to the oldest live waiter; returns it if nobody listens.
    fn hand_off(
        state: &mut PoolState,
        connection: Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        let mut connection = connection;
        while let Some(tx) = state.waiters.pop_front() {
            let id = connection.id();
            state.checked_out.insert(id, connection.clone());
            match tx.send(Handoff::Connection(connection)) {
                Ok(()) => return None,
                Err(returned) => {
                    state.checked_out.remove(&id);
                    connection = returned.into_connection()?;
                }
            }
        }
        Some(connection)
    }

    /// Offers a free creation slot to the oldest live waiter.
    fn offer_slot(state: &mut PoolState) {
        while let Some(tx) = state.waiters.pop_front() {
            state.creating += 1;
            if tx.send(Handoff::Reserved).is_ok() {
                return;
            }
            state.creating -= 1;
        }
    }

    fn is_expired(&self, connection: &Arc<dyn Connection>) -> bool {
        match self.config.connection_ttl() {
            Some(ttl) => connection.created_at().elapsed() >= ttl,
            None => false,
        }
    }

    fn managed(self: &Arc<Self>, connection: Arc<dyn Connection>) -> ManagedConnection {
        ManagedConnection {
            connection,
            pool: self.clone(),
            disposed: false,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.host)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A queued acquire. Whatever the pool handed over is returned to it if the
/// waiter goes away before taking it.
struct Waiter<'a> {
    pool: &'a ConnectionPool,
    rx: oneshot::Receiver<Handoff>,
}

impl Waiter<'_> {
    /// Stops listening; returns a connection that arrived meanwhile.
    fn settle(&mut self) -> Option<Arc<dyn Connection>> {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Connection(connection)) => Some(connection),
            Ok(Handoff::Reserved) => {
                self.pool.release_slot();
                None
            }
            Err(_) => None,
        }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.settle() {
            tracing::debug!(
                host = %self.pool.host,
                connection = connection.id(),
                "Waiter cancelled, returning handed-off connection"
            );
            if let Err(err) = self.pool.dispose(connection) {
                tracing::warn!(error = %err, "Failed to return handed-off connection");
            }
        }
    }
}

/// A slot counted in `creating` while a connection is being established.
struct CreationSlot<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl<'a> CreationSlot<'a> {
    /// Uncounts the slot and returns the locked state for the caller to finish.
    fn release(mut self) -> MutexGuard<'a, PoolState> {
        self.armed = false;
        let mut state = self.pool.lock();
        state.creating -= 1;
        state
    }
}

impl Drop for CreationSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(host = %self.pool.host, "Connection attempt cancelled");
            self.pool.release_slot();
        }
    }
}

/// A connection checked out of a pool.
///
/// Must be returned with [`dispose`](Self::dispose). Dropping an undisposed
/// handle logs a warning and returns the connection.
pub struct ManagedConnection {
    connection: Arc<dyn Connection>,
    pool: Arc<ConnectionPool>,
    disposed: bool,
}

impl ManagedConnection {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn dispose(mut self) -> Result<()> {
        self.disposed = true;
        self.pool.dispose(self.connection.clone())
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("connection", &self.connection.id())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        tracing::warn!(
            host = %self.pool.host(),
            connection = self.connection.id(),
            "Connection dropped without dispose"
        );
        if let Err(err) = self.pool.dispose(self.connection.clone()) {
            tracing::warn!(error = %err, "Failed to return dropped connection");
        }
    }
}
