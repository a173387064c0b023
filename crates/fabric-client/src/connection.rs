//! Connection abstraction shared by both wire protocols.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fabric_common::protocol::error::Result;
use fabric_common::{HostDescription, Request, Response};
use tokio::time::Instant;

/// A live connection to one cluster endpoint.
///
/// Implemented by `HttpConnection` (one HTTP/1.1 socket, one request at a
/// time) and `VstConnection` (one socket shared by many in-flight messages).
/// A connection belongs to exactly one pool for its whole life.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Pool-unique identifier.
    fn id(&self) -> u64;

    fn host(&self) -> &HostDescription;

    fn created_at(&self) -> Instant;

    /// True once the socket failed or [`close`](Self::close) was called.
    fn is_closed(&self) -> bool;

    /// Sends one request and waits for its response.
    async fn execute(&self, request: &Request) -> Result<Response>;

    fn close(&self);
}

/// Creates connections for a host's pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(&self, host: &HostDescription) -> Result<Arc<dyn Connection>>;
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide unique connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
