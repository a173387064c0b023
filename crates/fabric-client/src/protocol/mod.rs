//! Wire protocols.
//!
//! Both protocols share the same call policy ([`RequestPolicy`]): follow
//! redirects, fail over on socket errors and back off on transient ones. They
//! differ in how a single exchange with one host works:
//!
//! - **HTTP**: one request per pooled connection at a time
//! - **VST**: many requests multiplexed over a single socket per host

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fabric_common::protocol::error::{FabricError, Result};
use fabric_common::{HostDescription, Request, Response};

use crate::config::RetryConfig;
use crate::handler::HostHandler;
use crate::host::Host;

pub mod http;
pub mod vst;

pub use http::{HttpConnection, HttpConnectionFactory, HttpProtocol};
pub use vst::{MessageStore, VstConnection, VstConnectionFactory, VstProtocol};

/// One authenticated request/response exchange with a given host.
#[async_trait]
pub(crate) trait HostExchange: Send + Sync {
    async fn exchange(&self, host: &Arc<Host>, request: &Request) -> Result<Response>;
}

/// Redirect, failover and backoff rules around single-host exchanges.
pub struct RequestPolicy {
    handler: Arc<HostHandler>,
    retry: RetryConfig,
    max_redirects: usize,
}

impl RequestPolicy {
    pub fn new(handler: Arc<HostHandler>) -> Self {
        Self {
            handler,
            retry: RetryConfig::default(),
            max_redirects: 5,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn handler(&self) -> &Arc<HostHandler> {
        &self.handler
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    pub(crate) async fn execute<E: HostExchange + ?Sized>(
        &self,
        exchange: &E,
        request: Request,
    ) -> Result<Response> {
        let mut request = request;
        let mut redirects = 0;

        loop {
            match self.execute_with_failover(exchange, &request).await {
                Err(FabricError::Redirect { location }) => {
                    if redirects >= self.max_redirects {
                        return Err(FabricError::TooManyRedirects(self.max_redirects));
                    }
                    redirects += 1;

                    let target = HostDescription::from_endpoint(&location)?;
                    tracing::debug!(location = %location, hop = redirects, "Following redirect");
                    self.handler.close_current_on_error();
                    self.handler.fail();
                    request.host_hint = Some(target);
                }
                Err(err) => {
                    // The next call starts with a fresh failover budget
                    self.handler.reset();
                    return Err(err);
                }
                Ok(response) => return Ok(response),
            }
        }
    }

    async fn execute_with_failover<E: HostExchange + ?Sized>(
        &self,
        exchange: &E,
        request: &Request,
    ) -> Result<Response> {
        let access = request.access_type();
        loop {
            let host = self
                .handler
                .get(request.host_hint.as_ref(), access)
                .await
                .ok_or_else(|| no_host_available(&self.handler))?;

            match self.execute_with_backoff(exchange, &host, request).await {
                Ok(response) => {
                    self.handler.success();
                    self.handler.confirm().await;
                    return Ok(response);
                }
                Err(err) if err.is_socket_failure() && request.host_hint.is_none() => {
                    tracing::warn!(host = %host, error = %err, "Request failed, trying another host");
                    self.handler.fail();
                    if !self.handler.has_next() {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn execute_with_backoff<E: HostExchange + ?Sized>(
        &self,
        exchange: &E,
        host: &Arc<Host>,
        request: &Request,
    ) -> Result<Response> {
        let mut attempt = 0;
        let mut backoff_ms = self.retry.initial_backoff_ms;

        loop {
            let result = exchange.exchange(host, request).await;
            let err = match &result {
                Err(err) if err.is_transient() => err,
                _ => return result,
            };
            if attempt >= self.retry.max_retries || backoff_ms > self.retry.max_backoff_ms {
                return result;
            }

            attempt += 1;
            tracing::warn!(
                host = %host,
                attempt,
                backoff_ms,
                error = %err,
                "Transient failure, retrying after backoff"
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = self.retry.next_backoff_ms(backoff_ms);
        }
    }
}

/// Maps a non-2xx response to an error.
///
/// Redirects become [`FabricError::Redirect`] so the policy can follow them.
pub(crate) fn check_response(host: &HostDescription, response: Response) -> Result<Response> {
    if response.is_success() {
        return Ok(response);
    }
    if response.is_redirect() {
        if let Some(location) = response.header("location") {
            return Err(FabricError::Redirect {
                location: location.to_string(),
            });
        }
    }

    let error_num = response.error_body().and_then(|e| e.error_num);
    Err(FabricError::Server {
        status: response.status_code,
        error_num,
        message: response.error_message(),
        host: host.to_string(),
    })
}

pub(crate) fn no_host_available(handler: &HostHandler) -> FabricError {
    FabricError::NoHostAvailable {
        last: handler.last_attempted().map(|h| h.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostDescription {
        HostDescription::new("10.0.0.1", 8529)
    }

    #[test]
    fn test_check_response_passes_2xx() {
        let response = Response::new(201).with_body("{}");
        assert_eq!(check_response(&host(), response.clone()).unwrap(), response);
    }

    #[test]
    fn test_check_response_redirect_needs_location() {
        let redirect = Response::new(307).with_header("Location", "http://10.0.0.2:8529/");
        assert!(matches!(
            check_response(&host(), redirect),
            Err(FabricError::Redirect { location }) if location == "http://10.0.0.2:8529/"
        ));

        let bare = Response::new(307);
        assert!(matches!(
            check_response(&host(), bare),
            Err(FabricError::Server { status: 307, .. })
        ));
    }

    #[test]
    fn test_check_response_plain_text_error() {
        let response = Response::new(500).with_body("internal failure");
        match check_response(&host(), response) {
            Err(FabricError::Server {
                status,
                error_num,
                message,
                ..
            }) => {
                assert_eq!(status, 500);
                assert_eq!(error_num, None);
                assert_eq!(message, "internal failure");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
