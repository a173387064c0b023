//! Fabric Request Envelope
//!
//! A [`Request`] is the protocol-agnostic unit handed to the executor. The
//! HTTP protocol renders it into a URL plus headers, the VST protocol encodes
//! it into a message header. The body is opaque bytes; this layer never
//! inspects it.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::endpoint::HostDescription;

/// HTTP verb of a request.
///
/// The numeric codes are the ones used in VST message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMethod {
    Delete,
    Get,
    Post,
    Put,
    Head,
    Patch,
    Options,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Delete => "DELETE",
            RequestMethod::Get => "GET",
            RequestMethod::Post => "POST",
            RequestMethod::Put => "PUT",
            RequestMethod::Head => "HEAD",
            RequestMethod::Patch => "PATCH",
            RequestMethod::Options => "OPTIONS",
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            RequestMethod::Delete => 0,
            RequestMethod::Get => 1,
            RequestMethod::Post => 2,
            RequestMethod::Put => 3,
            RequestMethod::Head => 4,
            RequestMethod::Patch => 5,
            RequestMethod::Options => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RequestMethod::Delete),
            1 => Some(RequestMethod::Get),
            2 => Some(RequestMethod::Post),
            3 => Some(RequestMethod::Put),
            4 => Some(RequestMethod::Head),
            5 => Some(RequestMethod::Patch),
            6 => Some(RequestMethod::Options),
            _ => None,
        }
    }

    /// Case-insensitive parse of an HTTP verb.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "DELETE" => Some(RequestMethod::Delete),
            "GET" => Some(RequestMethod::Get),
            "POST" => Some(RequestMethod::Post),
            "PUT" => Some(RequestMethod::Put),
            "HEAD" => Some(RequestMethod::Head),
            "PATCH" => Some(RequestMethod::Patch),
            "OPTIONS" => Some(RequestMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a request only reads, so deployments with read replicas may route
/// it away from the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    Read,
    Write,
    DirtyRead,
}

/// A logical request to the cluster.
///
/// # Example
///
/// ```
/// use fabric_common::{Request, RequestMethod};
///
/// let request = Request::new(RequestMethod::Get, "/_api/collection")
///     .with_tenant("acme")
///     .with_database("orders")
///     .with_query_param("excludeSystem", "true");
///
/// assert_eq!(
///     request.request_uri(),
///     "/_tenant/acme/_fabric/orders/_api/collection?excludeSystem=true"
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub tenant: Option<String>,
    pub database: Option<String>,
    pub method: RequestMethod,
    pub path: String,
    pub header_params: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: Option<Bytes>,
    /// Pins the call to a specific coordinator (cursor follow-ups, redirects)
    pub host_hint: Option<HostDescription>,
    pub access_type: Option<AccessType>,
}

impl Request {
    pub fn new(method: RequestMethod, path: impl Into<String>) -> Self {
        Request {
            tenant: None,
            database: None,
            method,
            path: path.into(),
            header_params: BTreeMap::new(),
            query_params: BTreeMap::new(),
            body: None,
            host_hint: None,
            access_type: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Header names are stored lowercased.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.header_params
            .insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_host_hint(mut self, host: HostDescription) -> Self {
        self.host_hint = Some(host);
        self
    }

    pub fn with_access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = Some(access_type);
        self
    }

    /// Explicit access type, or one derived from the method.
    pub fn access_type(&self) -> AccessType {
        self.access_type.unwrap_or(match self.method {
            RequestMethod::Get | RequestMethod::Head | RequestMethod::Options => AccessType::Read,
            _ => AccessType::Write,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Path prefixed with the tenant and database segments.
    pub fn full_path(&self) -> String {
        let mut full = String::new();
        if let Some(tenant) = &self.tenant {
            full.push_str("/_tenant/");
            full.push_str(tenant);
        }
        if let Some(database) = &self.database {
            full.push_str("/_fabric/");
            full.push_str(database);
        }
        if !self.path.starts_with('/') {
            full.push('/');
        }
        full.push_str(&self.path);
        full
    }

    /// Percent-encoded query string without the leading `?`.
    pub fn query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query_params.iter())
            .finish()
    }

    /// Origin-form request target: full path plus query string.
    pub fn request_uri(&self) -> String {
        let path = self.full_path();
        if self.query_params.is_empty() {
            path
        } else {
            format!("{}?{}", path, self.query_string())
        }
    }
}
