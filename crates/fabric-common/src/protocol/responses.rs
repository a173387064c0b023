//! Fabric Response Envelope
//!
//! A [`Response`] is what a protocol returns for a [`Request`](super::Request):
//! a status code, headers and an opaque body.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;

/// Status code used by servers to signal an expired or missing token.
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;

/// Error document returned by the server alongside non-2xx status codes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorBody {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_num: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub code: Option<u16>,
}

/// A response from a cluster endpoint.
///
/// # Example
///
/// ```
/// use fabric_common::Response;
///
/// let response = Response::new(200)
///     .with_header("Content-Type", "application/json")
///     .with_body(r#"{"version":"3.9"}"#);
///
/// assert!(response.is_success());
/// assert_eq!(response.header("content-type"), Some("application/json"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status_code: u16,
    /// Header names are lowercased
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Response {
            status_code,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or(&[])
    }

    /// Parses the server error document, if the body carries one.
    pub fn error_body(&self) -> Option<ServerErrorBody> {
        let body = self.body.as_ref()?;
        serde_json::from_slice::<ServerErrorBody>(body)
            .ok()
            .filter(|e| e.error || e.error_message.is_some())
    }

    /// Human-readable reason for a failed response.
    pub fn error_message(&self) -> String {
        match self.error_body().and_then(|e| e.error_message) {
            Some(message) => message,
            None => match &self.body {
                Some(body) if !body.is_empty() => String::from_utf8_lossy(body).into_owned(),
                _ => format!("status {}", self.status_code),
            },
        }
    }
}
