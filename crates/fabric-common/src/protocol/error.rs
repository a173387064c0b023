use thiserror::Error;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    #[error("Unknown host: {0}")]
    UnknownHost(String),

    #[error("No response from {0}")]
    NoResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Timed out after {ms}ms waiting for a connection to {host}")]
    PoolTimeout { host: String, ms: u64 },

    #[error("Server error {status} from {host}: {message}")]
    Server {
        status: u16,
        error_num: Option<i64>,
        message: String,
        host: String,
    },

    #[error("Redirected to {location}")]
    Redirect { location: String },

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("No host available (last attempted: {})", .last.as_deref().unwrap_or("none"))]
    NoHostAvailable { last: Option<String> },

    #[error("Connection pool misuse: {0}")]
    PoolMisuse(String),

    #[error("Connection pool for {0} is closed")]
    PoolClosed(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl FabricError {
    /// Errors worth retrying against the same host after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            FabricError::UnknownHost(_) | FabricError::NoResponse(_) => true,
            FabricError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Socket-level failures that should move the call to another host.
    pub fn is_socket_failure(&self) -> bool {
        matches!(
            self,
            FabricError::Connection(_) | FabricError::ConnectionReset(_) | FabricError::Io(_)
        )
    }

    /// HTTP-style status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FabricError::Server { status, .. } => Some(*status),
            FabricError::Redirect { .. } => Some(307),
            _ => None,
        }
    }
}

impl From<url::ParseError> for FabricError {
    fn from(err: url::ParseError) -> Self {
        FabricError::InvalidEndpoint(err.to_string())
    }
}

impl From<rustls::Error> for FabricError {
    fn from(err: rustls::Error) -> Self {
        FabricError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
