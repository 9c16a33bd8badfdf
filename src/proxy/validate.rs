//! Request validation
//!
//! Ordered checks run against the normalized target before any network
//! call. The first failing check decides the response. Preflight requests
//! are answered before the target is even parsed.

use hyper::header::{HeaderMap, HeaderName, ORIGIN};
use hyper::Method;

use crate::config::CorsConfig;
use crate::error::ProksyError;
use crate::proxy::location::TargetLocation;

/// Reserved host answering whether CORS is needed at all
pub const SELF_TEST_HOST: &str = "iscorsneeded";

/// Outcome of validating one inbound request
#[derive(Debug)]
pub enum Verdict {
    /// Forward the request to this target
    Proxy(TargetLocation),
    /// No usable target; serve the help content
    Usage,
    /// Self-test request, answered with `no`
    SelfTest,
    /// Same-origin caller; redirect it to the target href
    SameOrigin(String),
    /// Terminal client error
    Reject(ProksyError),
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    require_header: Option<Vec<HeaderName>>,
    redirect_same_origin: bool,
}

impl RequestValidator {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            require_header: config.require_header.clone(),
            redirect_same_origin: config.redirect_same_origin,
        }
    }

    /// Preflight requests never reach any other check
    pub fn is_preflight(method: &Method) -> bool {
        method == Method::OPTIONS
    }

    /// Run the checks in order. `raw_path` is the request path and query
    /// including the leading slash.
    pub fn validate(
        &self,
        raw_path: &str,
        headers: &HeaderMap,
        location: Option<TargetLocation>,
    ) -> Verdict {
        let Some(location) = location else {
            if has_single_slash_scheme(raw_path) {
                return Verdict::Reject(ProksyError::MissingSlash);
            }
            return Verdict::Usage;
        };

        if location.host() == SELF_TEST_HOST {
            return Verdict::SelfTest;
        }

        if let Some(port) = location.port().filter(|port| *port > u32::from(u16::MAX)) {
            return Verdict::Reject(ProksyError::InvalidPort(port));
        }

        // Shorthand targets only work for IP literals; named hosts need an explicit scheme.
        // This keeps paths like /favicon.ico from being proxied.
        if !has_explicit_scheme(raw_path) && !location.is_ip_literal() {
            return Verdict::Reject(ProksyError::InvalidHost(location.hostname().to_string()));
        }

        if !self.has_required_header(headers) {
            let names = self
                .require_header
                .iter()
                .flatten()
                .map(|name| name.as_str().to_string())
                .collect();
            return Verdict::Reject(ProksyError::MissingRequiredHeader(names));
        }

        if self.redirect_same_origin && is_same_origin(headers, &location) {
            return Verdict::SameOrigin(location.href().to_string());
        }

        Verdict::Proxy(location)
    }

    fn has_required_header(&self, headers: &HeaderMap) -> bool {
        match &self.require_header {
            Some(names) => names.iter().any(|name| headers.contains_key(name)),
            None => true,
        }
    }
}

/// `/http:/host` style paths: a scheme followed by a single slash
fn has_single_slash_scheme(raw_path: &str) -> bool {
    let Some(after_scheme) = strip_scheme(raw_path) else {
        return false;
    };
    let mut rest = after_scheme.chars();
    rest.next() == Some('/') && rest.next().is_some_and(|c| c != '/')
}

fn has_explicit_scheme(raw_path: &str) -> bool {
    strip_scheme(raw_path).is_some()
}

/// Strip `/http:` or `/https:` (case-insensitive)
fn strip_scheme(raw_path: &str) -> Option<&str> {
    let rest = raw_path.strip_prefix('/')?;
    ["https:", "http:"].iter().find_map(|prefix| {
        let head = rest.get(..prefix.len())?;
        head.eq_ignore_ascii_case(prefix)
            .then(|| &rest[prefix.len()..])
    })
}

fn is_same_origin(headers: &HeaderMap, location: &TargetLocation) -> bool {
    let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let href = location.href();
    !origin.is_empty()
        && href.starts_with(origin)
        && href.as_bytes().get(origin.len()) == Some(&b'/')
}
