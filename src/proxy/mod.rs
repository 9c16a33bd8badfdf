//! Proxy server implementation
//!
//! This module provides the CORS proxy functionality including:
//! - Target URL normalization
//! - Request validation and CORS header injection
//! - Server-side redirect following
//! - Upstream transport (direct or through a chained proxy)

pub mod cors;
pub mod failure;
pub mod handler;
pub mod help;
pub mod location;
pub mod server;
pub mod transport;
pub mod upstream;
pub mod validate;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;

pub use cors::CorsInjector;
pub use handler::{InitialRequestHook, ProxyHandler, RequestState};
pub use location::{parse_target, Scheme, TargetLocation};
pub use server::{ProxyServer, ProxyServerBuilder};
pub use transport::ProxyTransport;
pub use upstream::{EnvProxyResolver, UpstreamProxy, UpstreamResolver};
pub use validate::{RequestValidator, Verdict};

/// Error type carried by streamed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used for both directions; bodies are streamed, never buffered
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

pub fn incoming(body: Incoming) -> ProxyBody {
    body.map_err(|e| Box::new(e) as BoxError).boxed()
}
