//! Fabric Client
//!
//! Client transport for a multi-tenant database cluster: per-host connection
//! pools, a host directory that can follow the cluster's topology, host
//! selection strategies and two wire protocols (HTTP/1.1 and VST).
//!
//! # Layers
//!
//! - **[`ConnectionPool`]** / [`Host`]: bounded pools with fair hand-off
//! - **[`HostResolver`]** / [`HostSet`]: static or discovered host directory
//! - **[`HostHandler`]**: fallback, random or round-robin selection
//! - **[`HttpProtocol`]** / [`VstProtocol`]: redirects, failover, backoff, auth
//! - **[`Executor`]**: wires the above from a [`ClientConfig`]

pub mod auth;
pub mod config;
pub mod connection;
pub mod executor;
pub mod handler;
pub mod host;
pub mod host_set;
pub mod pool;
pub mod protocol;
pub mod resolver;

#[cfg(test)]
mod testing;

pub use auth::{Authenticator, CredentialCache, LoginSecretProvider, SecretProvider, StaticTokenProvider};
pub use config::{ClientConfig, LoadBalancingStrategy, RetryConfig, WireProtocol};
pub use connection::{Connection, ConnectionFactory};
pub use executor::{Executor, ExecutorBuilder};
pub use handler::HostHandler;
pub use host::{Host, HostFactory};
pub use host_set::HostSet;
pub use pool::{ConnectionPool, ManagedConnection, PoolConfig, PoolStats};
pub use protocol::{
    HttpConnection, HttpConnectionFactory, HttpProtocol, MessageStore, RequestPolicy,
    VstConnection, VstConnectionFactory, VstProtocol,
};
pub use resolver::{EndpointSource, HostResolver};
