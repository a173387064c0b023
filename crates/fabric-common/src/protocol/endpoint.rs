//! Cluster endpoint identity.
//!
//! A [`HostDescription`] names one coordinator by address and port. It is the
//! key used to deduplicate hosts when the directory is refreshed, and the
//! value carried by host hints and redirect targets.

use std::fmt;
use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use super::error::{FabricError, Result};

/// Address and port of one cluster endpoint.
///
/// Equality and hashing are by value, so two descriptions built from
/// `tcp://10.0.0.1:8529` and `http://10.0.0.1:8529` identify the same host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostDescription {
    host: String,
    port: u16,
}

impl HostDescription {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        // Store IPv6 literals without brackets so `[::1]` and `::1` compare equal
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Parses a `host:port` pair as found in configuration files.
    ///
    /// A scheme prefix is accepted as well, in which case this behaves like
    /// [`from_endpoint`](Self::from_endpoint).
    ///
    /// # Example
    ///
    /// ```
    /// use fabric_common::HostDescription;
    ///
    /// let host = HostDescription::parse("127.0.0.1:8529").unwrap();
    /// assert_eq!(host.port(), 8529);
    ///
    /// let host = HostDescription::parse("[::1]:8529").unwrap();
    /// assert_eq!(host.host(), "::1");
    /// ```
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.contains("://") {
            return Self::from_endpoint(value);
        }
        Self::from_endpoint(&format!("tcp://{}", value))
    }

    /// Parses an endpoint string of the form `scheme://host:port[/path]`.
    ///
    /// Hostnames, IPv4 and bracketed IPv6 literals are accepted. Schemes with a
    /// well-known default port (`http`, `https`) may omit the port; any other
    /// scheme must carry one.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let url = Url::parse(endpoint.trim())?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(FabricError::InvalidEndpoint(format!(
                    "'{}' has no host",
                    endpoint
                )))
            }
        };

        let port = url.port_or_known_default().ok_or_else(|| {
            FabricError::InvalidEndpoint(format!("'{}' has no port", endpoint))
        })?;

        Ok(Self { host, port })
    }
}

impl fmt::Display for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}
