//! CORS header injection
//!
//! Every response leaving the proxy grants `Access-Control-Allow-Origin: *`
//! and exposes all of its own header names. Preflight request headers are
//! echoed back as grants and removed from the request so that they never
//! reach the origin server.

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD,
};
use hyper::Method;

/// Computes the CORS grants for a request
#[derive(Debug, Clone, Copy, Default)]
pub struct CorsInjector {
    /// Access-Control-Max-Age sent on preflight replies
    max_age: Option<u64>,
}

impl CorsInjector {
    pub fn new(max_age: Option<u64>) -> Self {
        Self { max_age }
    }

    /// Fresh set of CORS headers for a request
    pub fn headers_for(&self, method: &Method, request_headers: &mut HeaderMap) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.apply(&mut headers, method, request_headers);
        headers
    }

    /// Add CORS grants to `headers`, consuming the preflight headers of the request
    pub fn apply(&self, headers: &mut HeaderMap, method: &Method, request_headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

        if method == Method::OPTIONS {
            if let Some(max_age) = self.max_age {
                headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(max_age));
            }
        }

        if let Some(requested) = request_headers.remove(ACCESS_CONTROL_REQUEST_METHOD) {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, requested);
        }
        if let Some(requested) = request_headers.remove(ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested);
        }

        expose_all(headers);
    }
}

fn expose_all(headers: &mut HeaderMap) {
    let names = headers
        .keys()
        .filter(|name| *name != ACCESS_CONTROL_EXPOSE_HEADERS)
        .map(|name| name.as_str())
        .collect::<Vec<_>>()
        .join(",");

    // header names are always valid header value text
    if let Ok(value) = HeaderValue::from_str(&names) {
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, value);
    }
}
