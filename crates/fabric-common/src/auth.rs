//! Authentication Credentials for Fabric Clients
//!
//! This module holds the client-side credential configuration and the
//! authorization tokens attached to outgoing requests.
//!
//! # Modes
//!
//! - **JWT** (default): a token is obtained from a secret provider for each
//!   `(tenant, user)` pair and sent as `Authorization: bearer <token>`
//! - **API key**: a static key sent as `Authorization: apikey <key>`
//! - **Basic**: user and password sent as `Authorization: Basic ...` when token
//!   authentication is switched off
//! - **Disabled**: no `Authorization` header at all
//!
//! # Example
//!
//! ```
//! use fabric_common::auth::{AuthToken, Credentials};
//!
//! let credentials = Credentials::with_user("root", "secret");
//! assert!(credentials.requires_auth());
//! assert_eq!(format!("{}", credentials), "Jwt(root, *****)");
//!
//! let token = AuthToken::ApiKey("k-123".to_string());
//! assert_eq!(token.header_value(), "apikey k-123");
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

/// Default tenant used when neither the request nor the credentials name one.
pub const DEFAULT_TENANT: &str = "_mm";

/// Client credential configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub tenant: Option<String>,
    /// Use token authentication; when off, user/password go out as basic auth
    pub jwt_auth: bool,
}

impl Credentials {
    /// Token authentication for a user.
    pub fn with_user(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
            ..Self::disabled()
        }
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::disabled()
        }
    }

    /// Basic authentication for a user.
    pub fn with_basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jwt_auth: false,
            ..Self::with_user(user, password)
        }
    }

    pub fn disabled() -> Self {
        Self {
            user: None,
            password: None,
            api_key: None,
            tenant: None,
            jwt_auth: true,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some() || self.user.is_some()
    }

    pub fn user_name(&self) -> &str {
        self.user.as_deref().unwrap_or("root")
    }

    pub fn tenant_name(&self) -> &str {
        self.tenant.as_deref().unwrap_or(DEFAULT_TENANT)
    }

    /// Basic token for the configured user, when token authentication is off.
    pub fn basic_token(&self) -> Option<AuthToken> {
        if self.jwt_auth {
            return None;
        }
        let user = self.user.clone()?;
        Some(AuthToken::Basic {
            user,
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::disabled()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.api_key, &self.user) {
            (Some(_), _) => write!(f, "ApiKey(*****)"),
            (None, Some(user)) if self.jwt_auth => write!(f, "Jwt({}, *****)", user),
            (None, Some(user)) => write!(f, "Basic({}, *****)", user),
            (None, None) => write!(f, "Disabled"),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({})", self)
    }
}

/// A credential ready to be attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthToken {
    Bearer(String),
    ApiKey(String),
    Basic { user: String, password: String },
}

impl AuthToken {
    /// Value for the HTTP `Authorization` header.
    pub fn header_value(&self) -> String {
        match self {
            AuthToken::Bearer(token) => format!("bearer {}", token),
            AuthToken::ApiKey(key) => format!("apikey {}", key),
            AuthToken::Basic { user, password } => {
                format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
            }
        }
    }

    /// Header of the VST authentication message sent once per connection.
    pub fn vst_auth_header(&self) -> Value {
        match self {
            AuthToken::Bearer(token) => json!([1, 1000, "jwt", token]),
            AuthToken::ApiKey(key) => json!([1, 1000, "apikey", key]),
            AuthToken::Basic { user, password } => json!([1, 1000, "plain", user, password]),
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthToken::Bearer(_) => write!(f, "Bearer(*****)"),
            AuthToken::ApiKey(_) => write!(f, "ApiKey(*****)"),
            AuthToken::Basic { user, .. } => write!(f, "Basic({}, *****)", user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_disabled() {
        let credentials = Credentials::disabled();
        assert!(!credentials.requires_auth());
        assert!(credentials.jwt_auth);
        assert_eq!(credentials.tenant_name(), DEFAULT_TENANT);
        assert_eq!(format!("{}", credentials), "Disabled");
    }

    #[test]
    fn test_credentials_api_key_display_is_redacted() {
        let credentials = Credentials::with_api_key("super-secret");
        assert!(credentials.requires_auth());
        assert_eq!(format!("{}", credentials), "ApiKey(*****)");
        assert!(!format!("{:?}", credentials).contains("super-secret"));
    }

    #[test]
    fn test_basic_token_only_without_jwt() {
        assert!(Credentials::with_user("root", "pw").basic_token().is_none());

        let token = Credentials::with_basic("root", "pw").basic_token().unwrap();
        assert_eq!(token.header_value(), "Basic cm9vdDpwdw==");
    }

    #[test]
    fn test_bearer_header() {
        let token = AuthToken::Bearer("abc.def".to_string());
        assert_eq!(token.header_value(), "bearer abc.def");
        assert_eq!(format!("{:?}", token), "Bearer(*****)");
    }

    #[test]
    fn test_vst_auth_headers() {
        let jwt = AuthToken::Bearer("t".to_string()).vst_auth_header();
        assert_eq!(jwt, json!([1, 1000, "jwt", "t"]));

        let plain = AuthToken::Basic {
            user: "u".to_string(),
            password: "p".to_string(),
        }
        .vst_auth_header();
        assert_eq!(plain, json!([1, 1000, "plain", "u", "p"]));
    }

    #[test]
    fn test_credentials_deserialize_defaults() {
        let credentials: Credentials =
            serde_json::from_str(r#"{"user":"alice","password":"pw","tenant":"acme"}"#).unwrap();
        assert!(credentials.jwt_auth);
        assert_eq!(credentials.tenant_name(), "acme");
        assert_eq!(credentials.user_name(), "alice");
    }
}
