//! Fabric Common Types and Transport
//!
//! This crate provides the protocol envelope and the socket layer shared by
//! the Fabric cluster client.
//!
//! # Overview
//!
//! A Fabric cluster is a set of coordinators serving many tenants, each with
//! its own databases. Clients talk to coordinators over HTTP/1.1 or over VST,
//! a binary protocol that multiplexes many requests over one socket. This
//! crate contains the pieces both protocols share:
//!
//! - **Protocol Layer**: Request/Response envelopes, host identities, errors
//! - **Transport Layer**: async TCP/TLS connect and VST chunk framing
//! - **Auth**: credential configuration and authorization tokens
//!
//! # Components
//!
//! - [`protocol`] - Core protocol types (Request, Response, HostDescription, Error)
//! - [`transport`] - TCP transport and VST codec
//! - [`auth`] - Credentials and tokens
//!
//! # Example
//!
//! ```
//! use fabric_common::{HostDescription, Request, RequestMethod};
//!
//! let request = Request::new(RequestMethod::Get, "/_api/version")
//!     .with_tenant("acme")
//!     .with_host_hint(HostDescription::new("10.0.0.1", 8529));
//!
//! assert_eq!(request.full_path(), "/_tenant/acme/_api/version");
//! ```

pub mod auth;
pub mod protocol;
pub mod transport;

pub use protocol::*;
