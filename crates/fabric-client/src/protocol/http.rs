use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fabric_common::auth::AuthToken;
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::transport::TcpTransport;
use fabric_common::{HostDescription, Request, Response, STATUS_UNAUTHORIZED};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auth::Authenticator;
use crate::config::RetryConfig;
use crate::connection::{next_connection_id, Connection, ConnectionFactory};
use crate::handler::HostHandler;
use crate::host::Host;
use crate::protocol::{check_response, HostExchange, RequestPolicy};

/// One HTTP/1.1 connection to a host.
///
/// The hyper connection driver runs on its own task; the connection counts
/// as closed once that task ends.
pub struct HttpConnection {
    id: u64,
    host: HostDescription,
    created_at: Instant,
    sender: tokio::sync::Mutex<SendRequest<Full<Bytes>>>,
    closed: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    timeout: Option<Duration>,
}

impl HttpConnection {
    pub async fn connect(
        host: &HostDescription,
        transport: &TcpTransport,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let stream = transport.connect(host).await?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| map_hyper_error(e, host))?;

        let closed = Arc::new(AtomicBool::new(false));
        let driver = {
            let closed = closed.clone();
            let host = host.clone();
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    tracing::debug!(host = %host, error = %err, "HTTP connection ended with error");
                }
                closed.store(true, Ordering::SeqCst);
            })
        };

        Ok(Self {
            id: next_connection_id(),
            host: host.clone(),
            created_at: Instant::now(),
            sender: tokio::sync::Mutex::new(sender),
            closed,
            driver,
            timeout,
        })
    }

    fn build_request(&self, request: &Request) -> Result<hyper::Request<Full<Bytes>>> {
        let mut builder = hyper::Request::builder()
            .method(request.method.as_str())
            .uri(request.request_uri())
            .header(hyper::header::HOST, self.host.authority());
        for (name, value) in &request.header_params {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| FabricError::InvalidRequest(e.to_string()))
    }

    async fn exchange(&self, request: hyper::Request<Full<Bytes>>) -> Result<Response> {
        let mut sender = self.sender.lock().await;
        sender
            .ready()
            .await
            .map_err(|e| map_hyper_error(e, &self.host))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| map_hyper_error(e, &self.host))?;

        let status_code = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| map_hyper_error(e, &self.host))?
            .to_bytes();

        Ok(Response {
            status_code,
            headers,
            body: (!body.is_empty()).then_some(body),
        })
    }
}

#[async_trait]
impl Connection for HttpConnection {
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
            return Err(FabricError::ConnectionReset(format!("{}: connection closed", self.host)));
        }
        let http_request = self.build_request(request)?;

        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.exchange(http_request)).await {
                Ok(result) => result,
                Err(_) => {
                    // The response may still arrive; the socket cannot be reused
                    self.close();
                    Err(FabricError::Timeout(timeout.as_millis() as u64))
                }
            },
            None => self.exchange(http_request).await,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.driver.abort();
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Maps hyper failures to the classes the protocol acts on.
fn map_hyper_error(err: hyper::Error, host: &HostDescription) -> FabricError {
    if err.is_incomplete_message() {
        return FabricError::NoResponse(format!("{}: {}", host, err));
    }
    if err.is_canceled() || err.is_closed() {
        return FabricError::ConnectionReset(format!("{}: {}", host, err));
    }

    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return TcpTransport::map_io_error(
                io::Error::new(io_err.kind(), io_err.to_string()),
                &host.to_string(),
            );
        }
        source = cause.source();
    }
    FabricError::Connection(format!("{}: {}", host, err))
}

/// Opens [`HttpConnection`]s for host pools.
pub struct HttpConnectionFactory {
    transport: TcpTransport,
    timeout: Option<Duration>,
}

impl HttpConnectionFactory {
    pub fn new(transport: TcpTransport, timeout: Option<Duration>) -> Self {
        Self { transport, timeout }
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    async fn create(&self, host: &HostDescription) -> Result<Arc<dyn Connection>> {
        let connection = HttpConnection::connect(host, &self.transport, self.timeout).await?;
        Ok(Arc::new(connection))
    }
}

/// Request/response over pooled HTTP/1.1 connections.
///
/// # Policy
///
/// - **Auth**: attaches the authenticator's credential; on 401 invalidates
///   it, fetches a fresh one and retries exactly once
/// - **Transient failures** (unknown host, no response, 5xx): retried on the
///   same host with exponential backoff
/// - **Socket failures**: the host is marked failed and the call moves to the
///   next host the handler offers
/// - **Redirects**: followed to the `Location` host, up to `max_redirects`
pub struct HttpProtocol {
    policy: RequestPolicy,
    authenticator: Arc<Authenticator>,
    acquire_timeout: Option<Duration>,
}

impl HttpProtocol {
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

    async fn send(&self, host: &Arc<Host>, request: &Request, token: Option<&AuthToken>) -> Result<Response> {
        let managed = host.acquire_with_timeout(self.acquire_timeout).await?;

        let result = match token {
            Some(token) => {
                let mut request = request.clone();
                request
                    .header_params
                    .insert("authorization".to_string(), token.header_value());
                managed.connection().execute(&request).await
            }
            None => managed.connection().execute(request).await,
        };

        if let Err(err) = &result {
            if err.is_socket_failure() || matches!(err, FabricError::NoResponse(_)) {
                managed.connection().close();
            }
        }
        managed.dispose()?;
        result
    }
}

#[async_trait]
impl HostExchange for HttpProtocol {
    async fn exchange(&self, host: &Arc<Host>, request: &Request) -> Result<Response> {
        let tenant = request.tenant.as_deref();
        let token = self.authenticator.token(tenant).await?;
        let response = self.send(host, request, token.as_ref()).await?;

        if response.status_code != STATUS_UNAUTHORIZED {
            return check_response(host.description(), response);
        }
        let Some(rejected) = token else {
            return check_response(host.description(), response);
        };

        tracing::debug!(host = %host, "Credential rejected, refreshing");
        self.authenticator.invalidate(tenant, &rejected);
        let token = self.authenticator.token(tenant).await?;
        let response = self.send(host, request, token.as_ref()).await?;
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
    use std::sync::Mutex;

    fn protocol(ports: &[u16], factory: Arc<MockFactory>) -> HttpProtocol {
        let hosts = HostFactory::new(PoolConfig::default(), factory);
        let resolver = Arc::new(HostResolver::new_static(
            ports.iter().map(|p| desc(*p)).collect(),
            hosts,
        ));
        let handler = Arc::new(HostHandler::fallback(resolver, 3));
        HttpProtocol::new(handler, Arc::new(Authenticator::disabled())).with_retry(RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 8,
            backoff_multiplier: 2.0,
        })
    }

    fn get() -> Request {
        Request::new(RequestMethod::Get, "/_api/version")
    }

    #[tokio::test]
    async fn test_success_marks_host_good() {
        let protocol = protocol(&[1], MockFactory::new());
        let response = protocol.execute(get()).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(protocol.handler().last_attempted(), Some(desc(1)));
    }

    #[tokio::test]
    async fn test_server_error_body_is_mapped() {
        let factory = MockFactory::with_responder(|_, _| {
            Ok(Response::new(404).with_body(
                r#"{"error":true,"errorNum":1203,"errorMessage":"collection not found","code":404}"#,
            ))
        });
        let protocol = protocol(&[1], factory);

        match protocol.execute(get()).await {
            Err(FabricError::Server {
                status,
                error_num,
                message,
                host,
            }) => {
                assert_eq!(status, 404);
                assert_eq!(error_num, Some(1203));
                assert_eq!(message, "collection not found");
                assert_eq!(host, desc(1).to_string());
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.status_code)),
        }
    }

    #[tokio::test]
    async fn test_5xx_retries_with_bounded_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = MockFactory::with_responder(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(503))
        });
        let protocol = protocol(&[1], factory);

        let result = protocol.execute(get()).await;
        assert!(matches!(result, Err(FabricError::Server { status: 503, .. })));
        // initial attempt plus max_retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_backoff_stops_at_max_delay() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = MockFactory::with_responder(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(FabricError::NoResponse("silence".into()))
        });
        let protocol = protocol(&[1], factory).with_retry(RetryConfig {
            max_retries: 100,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
        });

        let result = protocol.execute(get()).await;
        assert!(matches!(result, Err(FabricError::NoResponse(_))));
        // waits of 1, 2 and 4ms, then the next (8ms) exceeds the cap
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = MockFactory::with_responder(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(Response::new(500))
            } else {
                Ok(Response::new(200))
            }
        });
        let protocol = protocol(&[1], factory);
        assert_eq!(protocol.execute(get()).await.unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_socket_failure_moves_to_next_host() {
        let factory = MockFactory::with_responder(|host, _| {
            if host.port() == 1 {
                Err(FabricError::ConnectionReset("reset by peer".into()))
            } else {
                Ok(Response::new(200))
            }
        });
        let protocol = protocol(&[1, 2], factory.clone());

        protocol.execute(get()).await.unwrap();
        assert_eq!(protocol.handler().last_attempted(), Some(desc(2)));
        // The reset connection was dropped from the pool
        let reset: Vec<_> = factory
            .connections()
            .into_iter()
            .filter(|c| c.host() == &desc(1))
            .collect();
        assert!(reset.iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_over() {
        let factory = MockFactory::new();
        factory.set_unreachable(&desc(1));
        let protocol = protocol(&[1, 2], factory);

        protocol.execute(get()).await.unwrap();
        assert_eq!(protocol.handler().last_attempted(), Some(desc(2)));
    }

    #[tokio::test]
    async fn test_socket_failure_without_alternative_surfaces_original_error() {
        let factory = MockFactory::with_responder(|_, _| {
            Err(FabricError::ConnectionReset("reset by peer".into()))
        });
        let protocol = protocol(&[1], factory);

        let result = protocol.execute(get()).await;
        assert!(matches!(result, Err(FabricError::ConnectionReset(_))));
    }

    #[tokio::test]
    async fn test_redirect_is_followed_to_location() {
        let factory = MockFactory::with_responder(|host, _| {
            if host.port() == 1 {
                Ok(Response::new(307).with_header("Location", "http://10.0.0.1:2/_api/version"))
            } else {
                Ok(Response::new(200).with_body("leader"))
            }
        });
        let protocol = protocol(&[1], factory);

        let response = protocol.execute(get()).await.unwrap();
        assert_eq!(response.body.as_deref(), Some(&b"leader"[..]));
        assert_eq!(protocol.handler().last_attempted(), Some(desc(2)));
    }

    #[tokio::test]
    async fn test_redirect_loop_hits_hop_limit() {
        let factory = MockFactory::with_responder(|host, _| {
            let next = if host.port() == 1 { 2 } else { 1 };
            Ok(Response::new(302).with_header("location", format!("http://10.0.0.1:{}/", next)))
        });
        let protocol = protocol(&[1], factory).with_max_redirects(3);

        let result = protocol.execute(get()).await;
        assert!(matches!(result, Err(FabricError::TooManyRedirects(3))));
    }

    #[tokio::test]
    async fn test_401_refreshes_token_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let factory = MockFactory::with_responder(move |_, request| {
            let auth = request.header("authorization").unwrap_or_default().to_string();
            log.lock().unwrap().push(auth.clone());
            if auth == "bearer fresh" {
                Ok(Response::new(200))
            } else {
                Ok(Response::new(401))
            }
        });
        let protocol = protocol(&[1], factory);
        let authenticator = Arc::new(Authenticator::new(
            Credentials::with_user("root", "pw"),
            Some(Arc::new(crate::auth::StaticTokenProvider::new("fresh")) as Arc<dyn crate::auth::SecretProvider>),
        ));
        authenticator
            .cache()
            .insert(fabric_common::auth::DEFAULT_TENANT, "root", "expired");
        let protocol = HttpProtocol {
            authenticator,
            ..protocol
        };

        protocol.execute(get()).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["bearer expired".to_string(), "bearer fresh".to_string()]
        );
    }

    #[tokio::test]
    async fn test_second_401_surfaces() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory = MockFactory::with_responder(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(401))
        });
        let protocol = HttpProtocol {
            authenticator: Arc::new(Authenticator::new(Credentials::with_api_key("k"), None)),
            ..protocol(&[1], factory)
        };

        let result = protocol.execute(get()).await;
        assert!(matches!(result, Err(FabricError::Server { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
