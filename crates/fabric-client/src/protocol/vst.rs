//! VelocyStream (VST 1.1) over a multiplexed socket.
//!
//! Every request gets a message id and a slot in the [`MessageStore`]; a
//! reader task reassembles incoming chunks and completes the slot whose id
//! the response carries, so responses may arrive in any order. A read failure
//! fails every pending slot and retires the socket.
//!
//! Writes go through a single writer task. A caller that gives up mid-write
//! leaves its frame to that task, so the socket never carries half a message.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_common::auth::AuthToken;
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::transport::{
    split_message, BoxedStream, Chunk, ChunkAssembler, TcpTransport, VstCodec,
};
use fabric_common::{HostDescription, Request, Response, STATUS_UNAUTHORIZED};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Authenticator;
use crate::config::RetryConfig;
use crate::connection::{next_connection_id, Connection, ConnectionFactory};
use crate::handler::HostHandler;
use crate::host::Host;
use crate::protocol::{check_response, HostExchange, RequestPolicy};

type Slot = oneshot::Sender<Result<Response>>;

/// Pending requests of one connection, keyed by message id.
#[derive(Default)]
pub struct MessageStore {
    pending: Mutex<HashMap<u64, Slot>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, message_id: u64) -> oneshot::Receiver<Result<Response>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(message_id, tx);
        rx
    }

    /// Delivers the outcome for `message_id`. Returns false if nobody waits
    /// for it any more.
    pub fn complete(&self, message_id: u64, response: Result<Response>) -> bool {
        match self.lock().remove(&message_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, message_id: u64) {
        self.lock().remove(&message_id);
    }

    /// Fails every pending request with a copy of `err`.
    pub fn fail_all(&self, err: &FabricError) {
        let pending = std::mem::take(&mut *self.lock());
        if !pending.is_empty() {
            tracing::debug!(pending = pending.len(), error = %err, "Failing pending VST messages");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(replicate(err)));
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Same failure class, so every waiter takes the same failover decision.
fn replicate(err: &FabricError) -> FabricError {
    match err {
        FabricError::ConnectionReset(msg) => FabricError::ConnectionReset(msg.clone()),
        FabricError::NoResponse(msg) => FabricError::NoResponse(msg.clone()),
        FabricError::Io(e) => FabricError::Io(io::Error::new(e.kind(), e.to_string())),
        FabricError::InvalidResponse(msg) => FabricError::InvalidResponse(msg.clone()),
        other => FabricError::Connection(other.to_string()),
    }
}

/// Chunks of one message, written as a unit.
struct Frame {
    chunks: Vec<Chunk>,
    written: oneshot::Sender<Result<()>>,
}

/// Drops the message slot when the request ends, however it ends.
struct SlotGuard<'a> {
    store: &'a MessageStore,
    message_id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.store.cancel(self.message_id);
    }
}

/// One multiplexed VST socket.
pub struct VstConnection {
    id: u64,
    host: HostDescription,
    created_at: Instant,
    frames: mpsc::UnboundedSender<Frame>,
    store: Arc<MessageStore>,
    next_message_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    chunk_size: usize,
    timeout: Option<Duration>,
}

impl VstConnection {
    /// Connects, sends the preamble and, with a token, authenticates the socket.
    ///
    /// # Errors
    ///
    /// Besides socket errors, a rejected authentication surfaces as
    /// `FabricError::Server` with the server's status.
    pub async fn connect(
        host: &HostDescription,
        transport: &TcpTransport,
        chunk_size: usize,
        timeout: Option<Duration>,
        token: Option<&AuthToken>,
    ) -> Result<Self> {
        let mut stream = transport.connect(host).await?;
        TcpTransport::write_handshake(&mut stream).await?;
        let (read_half, write_half) = tokio::io::split(stream);

        let store = Arc::new(MessageStore::new());
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_half,
            store.clone(),
            closed.clone(),
            host.clone(),
        ));
        let (frames, queue) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(write_half, queue, host.clone()));

        let connection = Self {
            id: next_connection_id(),
            host: host.clone(),
            created_at: Instant::now(),
            frames,
            store,
            next_message_id: AtomicU64::new(1),
            closed,
            reader,
            writer,
            chunk_size,
            timeout,
        };

        if let Some(token) = token {
            let auth_timeout = timeout.unwrap_or(transport.connect_timeout());
            connection.authenticate(token, auth_timeout).await?;
        }
        Ok(connection)
    }

    pub fn pending(&self) -> usize {
        self.store.pending()
    }

    async fn authenticate(&self, token: &AuthToken, timeout: Duration) -> Result<()> {
        let payload = VstCodec::encode_auth(&token.vst_auth_header())?;
        let response = self.send_message(payload, Some(timeout)).await?;
        if response.is_success() {
            tracing::debug!(host = %self.host, connection = self.id, "VST connection authenticated");
            return Ok(());
        }
        self.close();
        check_response(&self.host, response).map(|_| ())
    }

    async fn send_message(&self, payload: Bytes, timeout: Option<Duration>) -> Result<Response> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.store.register(message_id);
        let _slot = SlotGuard {
            store: &self.store,
            message_id,
        };
        let closed = || FabricError::ConnectionReset(format!("{}: connection closed", self.host));
        if self.is_closed() {
            return Err(closed());
        }

        let (written, done) = oneshot::channel();
        let frame = Frame {
            chunks: split_message(message_id, &payload, self.chunk_size),
            written,
        };
        if self.frames.send(frame).is_err() {
            self.close();
            return Err(closed());
        }
        match done.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.close();
                return Err(err);
            }
            Err(_) => {
                self.close();
                return Err(closed());
            }
        }

        let host = &self.host;
        let wait = async move {
            rx.await.unwrap_or_else(|_| {
                Err(FabricError::ConnectionReset(format!("{}: connection closed", host)))
            })
        };
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result,
                Err(_) => Err(FabricError::Timeout(timeout.as_millis() as u64)),
            },
            None => wait.await,
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    host: HostDescription,
) {
    while let Some(frame) = queue.recv().await {
        let result = TcpTransport::write_chunks(&mut writer, &frame.chunks).await;
        let failed = result.is_err();
        if let Err(err) = &result {
            tracing::debug!(host = %host, error = %err, "VST writer stopped");
        }
        let _ = frame.written.send(result);
        if failed {
            break;
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    store: Arc<MessageStore>,
    closed: Arc<AtomicBool>,
    host: HostDescription,
) {
    let mut assembler = ChunkAssembler::new();
    let err = loop {
        let chunk = match TcpTransport::read_chunk(&mut reader).await {
            Ok(chunk) => chunk,
            Err(err) => break err,
        };
        match assembler.push(chunk) {
            Ok(Some((message_id, payload))) => {
                let response = VstCodec::decode_response(payload);
                if !store.complete(message_id, response) {
                    tracing::debug!(host = %host, message_id, "Dropping response nobody waits for");
                }
            }
            Ok(None) => {}
            Err(err) => break err,
        }
    };

    closed.store(true, Ordering::SeqCst);
    let pending = store.pending();
    if pending > 0 {
        tracing::error!(host = %host, pending, error = %err, "VST connection failed with requests in flight");
    } else {
        tracing::debug!(host = %host, error = %err, "VST reader stopped");
    }
    store.fail_all(&err);
}

#[async_trait]
impl Connection for VstConnection {
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
        let payload = VstCodec::encode_request(request)?;
        self.send_message(payload, self.timeout).await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        self.writer.abort();
        self.store.fail_all(&FabricError::ConnectionReset(format!(
            "{}: connection closed",
            self.host
        )));
    }
}

impl Drop for VstConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Opens authenticated [`VstConnection`]s for host pools.
pub struct VstConnectionFactory {
    transport: TcpTransport,
    chunk_size: usize,
    timeout: Option<Duration>,
    authenticator: Arc<Authenticator>,
}

impl VstConnectionFactory {
    pub fn new(
        transport: TcpTransport,
        chunk_size: usize,
        timeout: Option<Duration>,
        authenticator: Arc<Authenticator>,
    ) -> Self {
        Self {
            transport,
            chunk_size,
            timeout,
            authenticator,
        }
    }
}

#[async_trait]
impl ConnectionFactory for VstConnectionFactory {
    async fn create(&self, host: &HostDescription) -> Result<Arc<dyn Connection>> {
        let token = self.authenticator.token(None).await?;
        let result = VstConnection::connect(
            host,
            &self.transport,
            self.chunk_size,
            self.timeout,
            token.as_ref(),
        )
        .await;

        match result {
            Ok(connection) => Ok(Arc::new(connection)),
            Err(err) => {
                if let (Some(token), Some(STATUS_UNAUTHORIZED)) = (&token, err.status_code()) {
                    self.authenticator.invalidate(None, token);
                }
                Err(err)
            }
        }
    }
}

/// Request/response over multiplexed sockets.
///
/// Sockets are never checked out for the length of a request, so concurrent
/// calls share them. A host opens up to `max_connections` sockets and then
/// rotates requests over them. Authentication happens once per socket;
/// a 401 closes the socket and retries once on a freshly authenticated one.
pub struct VstProtocol {
    policy: RequestPolicy,
    authenticator: Arc<Authenticator>,
    acquire_timeout: Option<Duration>,
}

impl VstProtocol {
    pub fn new(handler: Arc<HostHandler>, authenticator: Arc<Authenticator>) -> Self {
        Self {
            policy: RequestPolicy::new(handler),
            authenticator,
            acquire_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.policy = self.policy.with_retry(retry);
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.policy = self.policy.with_max_redirects(max_redirects);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn handler(&self) -> &Arc<HostHandler> {
        self.policy.handler()
    }

    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.policy.execute(self, request).await
    }

    pub fn close(&self) -> Result<()> {
        self.policy.handler().close()
    }

    async fn send(&self, host: &Arc<Host>, request: &Request) -> Result<(Arc<dyn Connection>, Response)> {
        let connection = host.pool().acquire_shared(self.acquire_timeout).await?;

        match connection.execute(request).await {
            Ok(response) => Ok((connection, response)),
            Err(err) => {
                if err.is_socket_failure() || matches!(err, FabricError::NoResponse(_)) {
                    connection.close();
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl HostExchange for VstProtocol {
    async fn exchange(&self, host: &Arc<Host>, request: &Request) -> Result<Response> {
        let first = self.send(host, request).await;
        let rejected = match &first {
            Ok((_, response)) => response.status_code == STATUS_UNAUTHORIZED,
            Err(err) => err.status_code() == Some(STATUS_UNAUTHORIZED),
        };
        if !rejected || !self.authenticator.credentials().requires_auth() {
            let (_, response) = first?;
            return check_response(host.description(), response);
        }

        tracing::debug!(host = %host, "Credential rejected, re-authenticating");
        if let Ok((connection, _)) = &first {
            connection.close();
            if let Some(token) = self.authenticator.token(None).await? {
                self.authenticator.invalidate(None, &token);
            }
        }
        let (_, response) = self.send(host, request).await?;
        check_response(host.description(), response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostFactory;
    use crate::pool::PoolConfig;
    use crate::resolver::HostResolver;
    use crate::testing::{desc, MockFactory};
    use fabric_common::auth::Credentials;
    use fabric_common::RequestMethod;
    use std::sync::atomic::AtomicUsize;

    fn protocol(factory: Arc<MockFactory>, authenticator: Authenticator) -> VstProtocol {
        let config = PoolConfig {
            max_connections: 1,
            ..PoolConfig::default()
        };
        let resolver = Arc::new(HostResolver::new_static(
            vec![desc(1), desc(2)],
            HostFactory::new(config, factory),
        ));
        VstProtocol::new(
            Arc::new(HostHandler::fallback(resolver, 3)),
            Arc::new(authenticator),
        )
        .with_retry(RetryConfig::disabled())
    }

    #[test]
    fn test_store_completes_by_id() {
        let store = MessageStore::new();
        let mut first = store.register(1);
        let mut second = store.register(2);

        assert!(store.complete(2, Ok(Response::new(201))));
        assert!(first.try_recv().is_err());
        assert_eq!(second.try_recv().unwrap().unwrap().status_code, 201);
        assert_eq!(store.pending(), 1);

        assert!(!store.complete(7, Ok(Response::new(200))));
    }

    #[test]
    fn test_store_fail_all_keeps_error_class() {
        let store = MessageStore::new();
        let mut rx = store.register(1);
        store.fail_all(&FabricError::ConnectionReset("peer went away".into()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(FabricError::ConnectionReset(msg)) if msg == "peer went away"
        ));
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_store_cancelled_slot_is_not_completed() {
        let store = MessageStore::new();
        let _rx = store.register(3);
        store.cancel(3);
        assert!(!store.complete(3, Ok(Response::new(200))));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_connection() {
        let factory = MockFactory::new();
        let protocol = Arc::new(protocol(factory.clone(), Authenticator::disabled()));

        let calls = (0..8).map(|_| {
            let protocol = protocol.clone();
            tokio::spawn(async move {
                protocol
                    .execute(Request::new(RequestMethod::Get, "/_api/version"))
                    .await
            })
        });
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().status_code, 200);
        }
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_reset_socket_fails_over() {
        let factory = MockFactory::with_responder(|host, _| {
            if host.port() == 1 {
                Err(FabricError::ConnectionReset("reset".into()))
            } else {
                Ok(Response::new(200))
            }
        });
        let protocol = protocol(factory, Authenticator::disabled());

        protocol
            .execute(Request::new(RequestMethod::Get, "/"))
            .await
            .unwrap();
        assert_eq!(protocol.handler().last_attempted(), Some(desc(2)));
    }

    #[tokio::test]
    async fn test_401_reconnects_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = MockFactory::with_responder(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Response::new(401))
            } else {
                Ok(Response::new(200))
            }
        });
        let protocol = protocol(
            factory.clone(),
            Authenticator::new(Credentials::with_api_key("key"), None),
        );

        protocol
            .execute(Request::new(RequestMethod::Get, "/"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The rejected socket was replaced
        assert_eq!(factory.created(), 2);
        assert!(factory.connections()[0].is_closed());
    }

    #[tokio::test]
    async fn test_401_without_credentials_surfaces() {
        let factory = MockFactory::with_responder(|_, _| Ok(Response::new(401)));
        let protocol = protocol(factory.clone(), Authenticator::disabled());

        let result = protocol.execute(Request::new(RequestMethod::Get, "/")).await;
        assert!(matches!(result, Err(FabricError::Server { status: 401, .. })));
        assert_eq!(factory.created(), 1);
    }
}
