use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the proxy
#[derive(Error, Debug)]
pub enum ProksyError {
    // Malformed input
    #[error("The URL is invalid: two slashes are needed after the http(s):.")]
    MissingSlash,

    #[error("Port number too large: {0}")]
    InvalidPort(u32),

    #[error("The request body cannot exceed {limit} bytes.")]
    PayloadTooLarge { limit: u64 },

    // Policy violations
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Missing required request header. Must specify one of: {}", .0.join(","))]
    MissingRequiredHeader(Vec<String>),

    // Upstream errors
    #[error("Host for {url} cannot be found.")]
    HostUnresolvable { url: String, reason: String },

    #[error("Host for {url} is unreachable: {reason}")]
    UpstreamUnreachable { url: String, reason: String },

    #[error("Upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Operation timed out")]
    Timeout,

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProksyError>;

impl ProksyError {
    /// Get the HTTP status code sent to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProksyError::MissingSlash
            | ProksyError::InvalidPort(_)
            | ProksyError::MissingRequiredHeader(_) => StatusCode::BAD_REQUEST,

            // 404 Not Found, also used for generic proxy errors so that internals stay opaque
            ProksyError::InvalidHost(_)
            | ProksyError::UpstreamProxy(_)
            | ProksyError::Tls(_)
            | ProksyError::Timeout
            | ProksyError::Http(_) => StatusCode::NOT_FOUND,

            // 413 Payload Too Large
            ProksyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 502 Bad Gateway
            ProksyError::HostUnresolvable { .. } | ProksyError::UpstreamUnreachable { .. } => {
                StatusCode::BAD_GATEWAY
            }

            // 500 Internal Server Error
            ProksyError::InvalidConfig(_) | ProksyError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short status message written on the response line for validation failures
    pub fn reason_phrase(&self) -> Option<&'static str> {
        match self {
            ProksyError::MissingSlash => Some("Missing slash"),
            ProksyError::InvalidPort(_) => Some("Invalid port"),
            ProksyError::InvalidHost(_) => Some("Invalid host"),
            ProksyError::MissingRequiredHeader(_) => Some("Header required"),
            _ => None,
        }
    }

    /// Whether the error was raised while talking to the origin (or a chained proxy)
    pub fn is_proxy_error(&self) -> bool {
        matches!(
            self,
            ProksyError::UpstreamProxy(_)
                | ProksyError::Tls(_)
                | ProksyError::Timeout
                | ProksyError::Http(_)
                | ProksyError::Io(_)
        )
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProksyError {
    fn from(err: hyper::Error) -> Self {
        ProksyError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for ProksyError {
    fn from(err: url::ParseError) -> Self {
        ProksyError::InvalidConfig(err.to_string())
    }
}
