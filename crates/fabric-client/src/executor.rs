//! Composition root.
//!
//! The [`Executor`] wires configuration, host directory, host handler and wire
//! protocol together and runs requests through them. It owns no policy of
//! its own: failover, retries and authentication live in the protocols.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::transport::TcpTransport;
use fabric_common::{HostDescription, Request, RequestMethod, Response, STATUS_FORBIDDEN};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::{Authenticator, LoginSecretProvider, SecretProvider};
use crate::config::{ClientConfig, LoadBalancingStrategy, WireProtocol};
use crate::connection::ConnectionFactory;
use crate::handler::HostHandler;
use crate::host::HostFactory;
use crate::host_set::HostSet;
use crate::protocol::{HttpConnectionFactory, HttpProtocol, VstConnectionFactory, VstProtocol};
use crate::resolver::{EndpointSource, HostResolver};

/// Path of the cluster's endpoint list.
pub const ENDPOINTS_PATH: &str = "/_api/cluster/endpoints";

enum Protocol {
    Http(HttpProtocol),
    Vst(VstProtocol),
}

impl Protocol {
    async fn execute(&self, request: Request) -> Result<Response> {
        match self {
            Protocol::Http(protocol) => protocol.execute(request).await,
            Protocol::Vst(protocol) => protocol.execute(request).await,
        }
    }

    fn handler(&self) -> &Arc<HostHandler> {
        match self {
            Protocol::Http(protocol) => protocol.handler(),
            Protocol::Vst(protocol) => protocol.handler(),
        }
    }

    fn close(&self) -> Result<()> {
        match self {
            Protocol::Http(protocol) => protocol.close(),
            Protocol::Vst(protocol) => protocol.close(),
        }
    }
}

struct ExecutorInner {
    config: ClientConfig,
    protocol: Protocol,
}

#[derive(Deserialize)]
struct EndpointsResponse {
    #[serde(default)]
    endpoints: Vec<Map<String, Value>>,
}

#[async_trait]
impl EndpointSource for ExecutorInner {
    async fn fetch_endpoints(&self, via: &HostDescription) -> Result<Vec<HostDescription>> {
        let request = Request::new(RequestMethod::Get, ENDPOINTS_PATH)
            .with_tenant(self.config.default_tenant.clone())
            .with_database(self.config.default_database.clone())
            .with_host_hint(via.clone());

        let response = match self.protocol.execute(request).await {
            Err(FabricError::Server {
                status: STATUS_FORBIDDEN,
                ..
            }) => {
                tracing::debug!(host = %via, "Endpoint list not accessible, keeping hosts");
                return Ok(Vec::new());
            }
            result => result?,
        };
        parse_endpoints(response.body_bytes())
    }
}

/// Extracts host descriptions from an endpoint list document.
///
/// Every string value of every entry is taken as an endpoint; entries that do
/// not parse are skipped.
pub fn parse_endpoints(body: &[u8]) -> Result<Vec<HostDescription>> {
    let document: EndpointsResponse = serde_json::from_slice(body)
        .map_err(|e| FabricError::InvalidResponse(format!("invalid endpoint list: {}", e)))?;

    let mut hosts = Vec::new();
    for value in document.endpoints.iter().flat_map(|entry| entry.values()) {
        let Some(endpoint) = value.as_str() else {
            continue;
        };
        match HostDescription::from_endpoint(endpoint) {
            Ok(host) => hosts.push(host),
            Err(err) => tracing::warn!(endpoint, error = %err, "Skipping invalid endpoint"),
        }
    }
    Ok(hosts)
}

/// Runs requests against the cluster.
///
/// Cheap to clone; clones share hosts, pools and credentials.
///
/// # Example
///
/// ```no_run
/// use fabric_client::{ClientConfig, Executor};
/// use fabric_common::{Request, RequestMethod};
///
/// # async fn example() -> fabric_common::Result<()> {
/// let executor = Executor::builder(ClientConfig::default().with_hosts(["10.0.0.1:8529"])).build()?;
///
/// let version: serde_json::Value = executor
///     .execute_json(Request::new(RequestMethod::Get, "/_api/version"))
///     .await?;
/// println!("{}", version);
///
/// executor.disconnect()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn builder(config: ClientConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    /// Executes `request` and hands the response to `deserializer`.
    ///
    /// # Errors
    ///
    /// Transport and server errors as returned by the protocol; a failing
    /// deserializer surfaces as `FabricError::Deserialization`.
    pub async fn execute<T, E, F>(&self, request: Request, deserializer: F) -> Result<T>
    where
        F: FnOnce(Response) -> std::result::Result<T, E>,
        E: fmt::Display,
    {
        let response = self.execute_raw(request).await?;
        deserializer(response).map_err(|e| FabricError::Deserialization(e.to_string()))
    }

    pub async fn execute_raw(&self, request: Request) -> Result<Response> {
        self.inner.protocol.execute(request).await
    }

    /// Executes `request` and decodes the JSON body.
    pub async fn execute_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        self.execute(request, |response| {
            serde_json::from_slice::<T>(response.body_bytes())
        })
        .await
    }

    /// Refreshes the host directory from the cluster now.
    ///
    /// A static directory is returned unchanged.
    pub async fn discover_endpoints(&self) -> Result<HostSet> {
        let resolver = self.host_handler().resolver();
        resolver.resolve(false, false).await
    }

    /// Handler shared by every call, e.g. to pin cursor follow-ups to a host.
    pub fn host_handler(&self) -> &Arc<HostHandler> {
        self.inner.protocol.handler()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Closes every pool.
    ///
    /// # Errors
    ///
    /// `PoolMisuse` if a connection is still checked out somewhere; the
    /// affected pools are drained instead.
    pub fn disconnect(&self) -> Result<()> {
        tracing::info!("Disconnecting from cluster");
        self.inner.protocol.close()
    }
}

/// Builds an [`Executor`] from a [`ClientConfig`].
pub struct ExecutorBuilder {
    config: ClientConfig,
    secret_provider: Option<Arc<dyn SecretProvider>>,
    connection_factory: Option<Arc<dyn ConnectionFactory>>,
}

impl ExecutorBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            secret_provider: None,
            connection_factory: None,
        }
    }

    /// Replaces the default login-based token source.
    pub fn with_secret_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.secret_provider = Some(provider);
        self
    }

    /// Replaces the protocol's own connection factory.
    pub fn with_connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connection_factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Executor> {
        let config = self.config;
        config.validate()?;
        let seeds = config.host_descriptions()?;

        let mut transport = TcpTransport::new(config.connect_timeout());
        if config.use_ssl {
            let tls = config.tls.clone().ok_or_else(|| {
                FabricError::Config("use_ssl requires a TLS client configuration".to_string())
            })?;
            transport = transport.with_tls(tls);
        }

        let credentials = config.credentials.clone();
        let provider = match self.secret_provider {
            Some(provider) => Some(provider),
            None if credentials.user.is_some() && credentials.jwt_auth => {
                Some(Arc::new(LoginSecretProvider::new(
                    seeds.clone(),
                    transport.clone(),
                    config.timeout(),
                    credentials.password.clone().unwrap_or_default(),
                )) as Arc<dyn SecretProvider>)
            }
            None => None,
        };
        let authenticator = Arc::new(Authenticator::new(credentials, provider));

        let factory = match self.connection_factory {
            Some(factory) => factory,
            None => match config.protocol {
                WireProtocol::Http => Arc::new(HttpConnectionFactory::new(
                    transport.clone(),
                    config.timeout(),
                )) as Arc<dyn ConnectionFactory>,
                WireProtocol::Vst => Arc::new(VstConnectionFactory::new(
                    transport.clone(),
                    config.chunk_size,
                    config.timeout(),
                    authenticator.clone(),
                )),
            },
        };
        let hosts = HostFactory::new(config.pool_config(), factory);

        let resolver = Arc::new(if config.acquire_host_list {
            HostResolver::new_dynamic(seeds, hosts, config.acquire_host_list_interval())
        } else {
            HostResolver::new_static(seeds, hosts)
        });

        let handler = Arc::new(match config.load_balancing {
            LoadBalancingStrategy::None => HostHandler::fallback(resolver.clone(), config.max_iterations),
            LoadBalancingStrategy::Random => HostHandler::random(resolver.clone(), config.max_iterations),
            LoadBalancingStrategy::RoundRobin => HostHandler::round_robin(resolver.clone()),
        });

        let acquire_timeout = config.pool_config().acquire_timeout();
        let protocol = match config.protocol {
            WireProtocol::Http => Protocol::Http(
                HttpProtocol::new(handler, authenticator)
                    .with_retry(config.retry.clone())
                    .with_max_redirects(config.max_redirects)
                    .with_acquire_timeout(acquire_timeout),
            ),
            WireProtocol::Vst => Protocol::Vst(
                VstProtocol::new(handler, authenticator)
                    .with_retry(config.retry.clone())
                    .with_max_redirects(config.max_redirects)
                    .with_acquire_timeout(acquire_timeout),
            ),
        };

        tracing::info!(
            hosts = ?config.hosts,
            protocol = ?config.protocol,
            load_balancing = ?config.load_balancing,
            discovery = config.acquire_host_list,
            "Executor ready"
        );

        let inner = Arc::new(ExecutorInner { config, protocol });
        let source: Arc<dyn EndpointSource> = inner.clone();
        resolver.init(Arc::downgrade(&source));

        Ok(Executor { inner })
    }
}
