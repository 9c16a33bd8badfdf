//! Proksy - CORS Reverse Proxy
//!
//! Proxies `/<url>` to `<url>` and answers with CORS headers so that browser
//! code can read the response.
//!
//! ## Features
//!
//! - Permissive URL forms (`/http://host/path`, `//host/path`, `host:port/path`)
//! - CORS preflight replies without touching the network
//! - Server-side redirect following with a bounded hop count
//! - Cookie stripping and origin-identifying header removal
//! - Optional chaining through an upstream HTTP or SOCKS5 proxy

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{ProksyError, Result};
pub use proxy::ProxyServer;
