use crate::error::{ProksyError, Result};
use hyper::header::{HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and upstream transport configuration
    pub proxy: ProxyServerConfig,
    /// Request handling policy
    pub cors: CorsConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Upstream connection timeout in seconds
    pub connect_timeout: u64,
    /// Timeout for upstream response headers in seconds
    pub request_timeout: u64,
    /// Request body ceiling in bytes, 0 disables the check
    pub max_body_bytes: u64,
    /// Append X-Forwarded-* headers to outbound requests
    pub xfwd: bool,
}

/// Process-wide request handling policy, read-only once the server is built
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Maximum number of redirects followed server-side
    pub max_redirects: u32,
    /// Redirect same-origin callers straight to the target
    pub redirect_same_origin: bool,
    /// At least one of these (lower-case) headers must be present
    pub require_header: Option<Vec<HeaderName>>,
    /// Request headers stripped before forwarding
    pub remove_headers: Vec<HeaderName>,
    /// Request headers set before forwarding
    pub set_headers: Vec<(HeaderName, HeaderValue)>,
    /// Help content served for requests without a usable target
    pub help_file: PathBuf,
    /// Access-Control-Max-Age for preflight replies
    pub cors_max_age: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            connect_timeout: 10,
            request_timeout: 30,
            max_body_bytes: 0,
            xfwd: true,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            max_redirects: 5,
            redirect_same_origin: false,
            require_header: None,
            remove_headers: Vec::new(),
            set_headers: Vec::new(),
            help_file: PathBuf::from("./README.md"),
            cors_max_age: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    ProksyError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("PROXY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                max_body_bytes: get_env_or("PROXY_MAX_BODY_BYTES", "0").parse().map_err(|_| {
                    ProksyError::InvalidConfig(
                        "PROXY_MAX_BODY_BYTES must be a valid number".into(),
                    )
                })?,
                xfwd: get_env_or("PROXY_XFWD", "true").parse().unwrap_or(true),
            },
            cors: CorsConfig {
                max_redirects: get_env_or("PROXY_MAX_REDIRECTS", "5").parse().map_err(|_| {
                    ProksyError::InvalidConfig(
                        "PROXY_MAX_REDIRECTS must be a valid number".into(),
                    )
                })?,
                redirect_same_origin: get_env_or("PROXY_REDIRECT_SAME_ORIGIN", "false")
                    .parse()
                    .unwrap_or(false),
                require_header: parse_require_header(&get_env_or("PROXY_REQUIRE_HEADER", ""))?,
                remove_headers: parse_header_list(
                    "PROXY_REMOVE_HEADERS",
                    &get_env_or("PROXY_REMOVE_HEADERS", ""),
                )?,
                set_headers: parse_set_headers(&get_env_or("PROXY_SET_HEADERS", ""))?,
                help_file: PathBuf::from(get_env_or("PROXY_HELP_FILE", "./README.md")),
                cors_max_age: match get_env_or("PROXY_CORS_MAX_AGE", "0").parse::<u64>() {
                    Ok(0) => None,
                    Ok(secs) => Some(secs),
                    Err(_) => {
                        return Err(ProksyError::InvalidConfig(
                            "PROXY_CORS_MAX_AGE must be a number of seconds".into(),
                        ))
                    }
                },
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn body_limit(&self) -> Option<u64> {
        (self.max_body_bytes > 0).then_some(self.max_body_bytes)
    }
}

/// Comma-separated header names; an empty list means no requirement
fn parse_require_header(raw: &str) -> Result<Option<Vec<HeaderName>>> {
    let names = parse_header_list("PROXY_REQUIRE_HEADER", raw)?;
    Ok(if names.is_empty() { None } else { Some(names) })
}

fn parse_header_list(key: &str, raw: &str) -> Result<Vec<HeaderName>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            // HeaderName lower-cases on parse
            HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ProksyError::InvalidConfig(format!("{} has invalid header name: {}", key, name))
            })
        })
        .collect()
}

/// JSON object of header name to value, e.g. `{"x-powered-by": "proksy"}`
fn parse_set_headers(raw: &str) -> Result<Vec<(HeaderName, HeaderValue)>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let map: BTreeMap<String, String> = serde_json::from_str(raw).map_err(|e| {
        ProksyError::InvalidConfig(format!("PROXY_SET_HEADERS must be a JSON object: {}", e))
    })?;

    map.into_iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                ProksyError::InvalidConfig(format!(
                    "PROXY_SET_HEADERS has invalid header name: {}",
                    name
                ))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|_| {
                ProksyError::InvalidConfig(format!(
                    "PROXY_SET_HEADERS has invalid value for {}",
                    name
                ))
            })?;
            Ok((name, value))
        })
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
