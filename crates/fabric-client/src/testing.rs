//! In-memory connections for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::{HostDescription, Request, Response};
use tokio::time::Instant;

use crate::connection::{next_connection_id, Connection, ConnectionFactory};
use crate::host::Host;
use crate::pool::PoolConfig;

pub type Responder = Arc<dyn Fn(&HostDescription, &Request) -> Result<Response> + Send + Sync>;

pub struct MockConnection {
    id: u64,
    host: HostDescription,
    created_at: Instant,
    closed: AtomicBool,
    responder: Responder,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn host(&self) -> &HostDescription {
        &self.host
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn execute(&self, request: &Request) -> Result<Response> {
        if self.is_closed() {
            return Err(FabricError::ConnectionReset(format!("{} closed", self.host)));
        }
        (self.responder)(&self.host, request)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockFactory {
    created: AtomicUsize,
    create_delay_ms: AtomicU64,
    unreachable: Mutex<HashSet<HostDescription>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    responder: Responder,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Self::with_responder(|_, _| Ok(Response::new(200)))
    }

    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HostDescription, &Request) -> Result<Response> + Send + Sync + 'static,
    {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            create_delay_ms: AtomicU64::new(0),
            unreachable: Mutex::new(HashSet::new()),
            connections: Mutex::new(Vec::new()),
            responder: Arc::new(responder),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn set_create_delay(&self, delay: Duration) {
        self.create_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, host: &HostDescription) {
        self.unreachable.lock().unwrap().insert(host.clone());
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create(&self, host: &HostDescription) -> Result<Arc<dyn Connection>> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unreachable.lock().unwrap().contains(host) {
            return Err(FabricError::Connection(format!("{} refused", host)));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(MockConnection {
            id: next_connection_id(),
            host: host.clone(),
            created_at: Instant::now(),
            closed: AtomicBool::new(false),
            responder: self.responder.clone(),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub fn desc(port: u16) -> HostDescription {
    HostDescription::new("10.0.0.1", port)
}

pub fn mock_host(port: u16, max_connections: usize, factory: Arc<MockFactory>) -> Arc<Host> {
    let config = PoolConfig {
        max_connections,
        ..PoolConfig::default()
    };
    Arc::new(Host::new(desc(port), config, factory))
}
