//! Token acquisition and caching.
//!
//! The [`Authenticator`] decides which `Authorization` credential a request
//! carries. Tokens come from a [`SecretProvider`] and are cached per
//! `(tenant, user)` until the server rejects them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fabric_common::auth::{AuthToken, Credentials};
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::transport::TcpTransport;
use fabric_common::{HostDescription, Request, RequestMethod};
use serde::Deserialize;
use serde_json::json;

use crate::connection::Connection;
use crate::protocol::http::HttpConnection;

/// Source of fresh tokens.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn fetch_token(&self, tenant: &str, user: &str) -> Result<String>;
}

/// Hands out one fixed token.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl SecretProvider for StaticTokenProvider {
    async fn fetch_token(&self, _tenant: &str, _user: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    jwt: String,
}

/// Logs in with user and password against `POST /_open/auth`.
///
/// Uses its own short-lived connections to the seed hosts so that fetching
/// a token never goes back through the pools it is authenticating.
pub struct LoginSecretProvider {
    seeds: Vec<HostDescription>,
    transport: TcpTransport,
    timeout: Option<Duration>,
    password: String,
}

impl LoginSecretProvider {
    pub fn new(
        seeds: Vec<HostDescription>,
        transport: TcpTransport,
        timeout: Option<Duration>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            seeds,
            transport,
            timeout,
            password: password.into(),
        }
    }

    async fn login(&self, seed: &HostDescription, request: &Request, user: &str) -> Result<String> {
        let connection = HttpConnection::connect(seed, &self.transport, self.timeout).await?;
        let result = connection.execute(request).await;
        connection.close();
        let response = result?;

        if !response.is_success() {
            return Err(FabricError::Authentication(format!(
                "login of '{}' rejected by {} with status {}: {}",
                user,
                seed,
                response.status_code,
                response.error_message()
            )));
        }
        serde_json::from_slice::<LoginResponse>(response.body_bytes())
            .map(|login| login.jwt)
            .map_err(|e| FabricError::Authentication(format!("invalid login response: {}", e)))
    }
}

#[async_trait]
impl SecretProvider for LoginSecretProvider {
    async fn fetch_token(&self, tenant: &str, user: &str) -> Result<String> {
        let body = serde_json::to_vec(&json!({
            "username": user,
            "password": self.password,
            "tenant": tenant,
        }))?;
        let request = Request::new(RequestMethod::Post, "/_open/auth")
            .with_header("content-type", "application/json")
            .with_body(body);

        let mut last_err = None;
        for seed in &self.seeds {
            match self.login(seed, &request, user).await {
                Ok(token) => {
                    tracing::debug!(tenant, user, host = %seed, "Obtained token");
                    return Ok(token);
                }
                Err(err) if err.is_socket_failure() || err.is_transient() => {
                    tracing::warn!(host = %seed, error = %err, "Login failed, trying next host");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or(FabricError::NoHostAvailable { last: None }))
    }
}

type CacheKey = (String, String);

/// Tokens keyed by `(tenant, user)`.
///
/// Concurrent misses for the same key share one fetch.
#[derive(Default)]
pub struct CredentialCache {
    tokens: Mutex<HashMap<CacheKey, String>>,
    fetches: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &str, user: &str) -> Option<String> {
        lock(&self.tokens).get(&key(tenant, user)).cloned()
    }

    pub fn insert(&self, tenant: &str, user: &str, token: impl Into<String>) {
        lock(&self.tokens).insert(key(tenant, user), token.into());
    }

    /// Drops the cached token if it is still `stale`.
    ///
    /// A token another task already refreshed is left alone.
    pub fn invalidate(&self, tenant: &str, user: &str, stale: &str) {
        let mut tokens = lock(&self.tokens);
        let key = key(tenant, user);
        if tokens.get(&key).is_some_and(|t| t == stale) {
            tokens.remove(&key);
            tracing::debug!(tenant, user, "Invalidated cached token");
        }
    }

    pub async fn get_or_fetch(
        &self,
        tenant: &str,
        user: &str,
        provider: &dyn SecretProvider,
    ) -> Result<String> {
        if let Some(token) = self.get(tenant, user) {
            return Ok(token);
        }

        let gate = lock(&self.fetches)
            .entry(key(tenant, user))
            .or_default()
            .clone();
        let _fetching = gate.lock().await;

        if let Some(token) = self.get(tenant, user) {
            return Ok(token);
        }
        let token = provider.fetch_token(tenant, user).await?;
        self.insert(tenant, user, token.clone());
        Ok(token)
    }
}

/// Chooses the credential attached to each request.
///
/// In order: a cached token, the API key, a freshly fetched token. With token
/// authentication switched off, user and password go out as basic auth.
pub struct Authenticator {
    credentials: Credentials,
    cache: CredentialCache,
    provider: Option<Arc<dyn SecretProvider>>,
}

impl Authenticator {
    pub fn new(credentials: Credentials, provider: Option<Arc<dyn SecretProvider>>) -> Self {
        Self {
            credentials,
            cache: CredentialCache::new(),
            provider,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Credentials::disabled(), None)
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Credential for a request addressed to `tenant`, if any is configured.
    pub async fn token(&self, tenant: Option<&str>) -> Result<Option<AuthToken>> {
        if !self.credentials.requires_auth() {
            return Ok(None);
        }
        if let Some(basic) = self.credentials.basic_token() {
            return Ok(Some(basic));
        }

        let tenant = self.tenant(tenant);
        let user = self.credentials.user_name();
        if let Some(token) = self.cache.get(tenant, user) {
            return Ok(Some(AuthToken::Bearer(token)));
        }
        if let Some(api_key) = &self.credentials.api_key {
            return Ok(Some(AuthToken::ApiKey(api_key.clone())));
        }

        let provider = self.provider.as_deref().ok_or_else(|| {
            FabricError::Authentication(format!("no secret provider configured for '{}'", user))
        })?;
        let token = self.cache.get_or_fetch(tenant, user, provider).await?;
        Ok(Some(AuthToken::Bearer(token)))
    }

    /// Forgets a token the server rejected.
    pub fn invalidate(&self, tenant: Option<&str>, token: &AuthToken) {
        if let AuthToken::Bearer(stale) = token {
            self.cache
                .invalidate(self.tenant(tenant), self.credentials.user_name(), stale);
        }
    }

    fn tenant<'a>(&'a self, tenant: Option<&'a str>) -> &'a str {
        tenant.unwrap_or_else(|| self.credentials.tenant_name())
    }
}

fn key(tenant: &str, user: &str) -> CacheKey {
    (tenant.to_string(), user.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
