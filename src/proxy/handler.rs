//! Proxy request handler with server-side redirect following
//!
//! Validates the inbound request, forwards it to the target and follows
//! 301/302/303 redirects internally up to the configured limit. Every reply,
//! including failures, carries the CORS grants.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE,
    HOST, LOCATION, ORIGIN, REFERER, SET_COOKIE, VARY,
};
use http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, error, instrument, warn};

use crate::config::{CorsConfig, ProxyServerConfig};
use crate::error::{ProksyError, Result};
use crate::proxy::cors::CorsInjector;
use crate::proxy::failure::error_response;
use crate::proxy::help::HelpText;
use crate::proxy::location::{parse_target, resolve_redirect, TargetLocation};
use crate::proxy::transport::ProxyTransport;
use crate::proxy::upstream::{UpstreamProxy, UpstreamResolver};
use crate::proxy::validate::{RequestValidator, Verdict};
use crate::proxy::{empty, full, incoming, ProxyBody};

const X_REQUEST_URL: HeaderName = HeaderName::from_static("x-request-url");
const X_FINAL_URL: HeaderName = HeaderName::from_static("x-final-url");
const SET_COOKIE2: HeaderName = HeaderName::from_static("set-cookie2");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PORT: HeaderName = HeaderName::from_static("x-forwarded-port");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Lets the embedding application answer a request itself.
///
/// Consulted once per request, after the target has been normalized and
/// before any validation. Returning a response ends the request there.
pub trait InitialRequestHook: Send + Sync {
    fn intercept(
        &self,
        request: &Parts,
        location: Option<&TargetLocation>,
    ) -> Option<Response<ProxyBody>>;
}

/// State of one inbound request, carried across its redirect hops
#[derive(Clone)]
pub struct RequestState {
    location: TargetLocation,
    redirect_count: u32,
    max_redirects: u32,
    proxy_base_url: String,
    resolver: Arc<dyn UpstreamResolver>,
}

impl RequestState {
    pub fn new(
        location: TargetLocation,
        max_redirects: u32,
        proxy_base_url: String,
        resolver: Arc<dyn UpstreamResolver>,
    ) -> Self {
        Self {
            location,
            redirect_count: 0,
            max_redirects,
            proxy_base_url,
            resolver,
        }
    }

    /// Target of the current hop
    pub fn location(&self) -> &TargetLocation {
        &self.location
    }

    pub fn redirect_count(&self) -> u32 {
        self.redirect_count
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    /// Externally visible base URL of this proxy, without a trailing slash
    pub fn proxy_base_url(&self) -> &str {
        &self.proxy_base_url
    }

    /// Upstream proxy the current hop has to go through, if any
    pub fn upstream(&self) -> Option<UpstreamProxy> {
        self.resolver.resolve(&self.location)
    }

    /// Move to a redirect target if another hop is allowed.
    /// The counter never exceeds the configured maximum.
    fn follow(&mut self, next: TargetLocation) -> bool {
        if self.redirect_count >= self.max_redirects {
            return false;
        }
        self.redirect_count += 1;
        self.location = next;
        true
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    transport: ProxyTransport,
    resolver: Arc<dyn UpstreamResolver>,
    hook: Option<Arc<dyn InitialRequestHook>>,
    validator: RequestValidator,
    cors: CorsInjector,
    help: HelpText,
    max_redirects: u32,
    remove_headers: Vec<HeaderName>,
    set_headers: Vec<(HeaderName, HeaderValue)>,
    xfwd: bool,
}

impl ProxyHandler {
    pub fn new(
        proxy: &ProxyServerConfig,
        cors: &CorsConfig,
        resolver: Arc<dyn UpstreamResolver>,
    ) -> Result<Self> {
        Ok(Self {
            transport: ProxyTransport::new(proxy)?,
            resolver,
            hook: None,
            validator: RequestValidator::new(cors),
            cors: CorsInjector::new(cors.cors_max_age),
            help: HelpText::new(cors.help_file.clone()),
            max_redirects: cors.max_redirects,
            remove_headers: cors.remove_headers.clone(),
            set_headers: cors.set_headers.clone(),
            xfwd: proxy.xfwd,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn InitialRequestHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Handle an incoming request. Never fails: errors become responses.
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(
        &self,
        req: Request<ProxyBody>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();
        let cors_headers = self.cors.headers_for(&parts.method, &mut parts.headers);

        if RequestValidator::is_preflight(&parts.method) {
            debug!("Answering preflight request");
            return reply(StatusCode::OK, cors_headers, empty());
        }

        let raw_path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let location = parse_target(raw_path.strip_prefix('/').unwrap_or(&raw_path));

        if let Some(hook) = &self.hook {
            if let Some(response) = hook.intercept(&parts, location.as_ref()) {
                debug!("Request answered by initial request hook");
                return response;
            }
        }

        let location = match self.validator.validate(&raw_path, &parts.headers, location) {
            Verdict::Proxy(location) => location,
            Verdict::Usage => return self.usage(cors_headers).await,
            Verdict::SelfTest => return self_test(),
            Verdict::SameOrigin(href) => return same_origin_redirect(cors_headers, &href),
            Verdict::Reject(err) => return error_response(&err, &cors_headers),
        };

        let proxy_base_url = proxy_base_url(&parts.headers);
        self.prepare_outbound(&mut parts.headers, client_addr);

        let mut state = RequestState::new(
            location,
            self.max_redirects,
            proxy_base_url,
            self.resolver.clone(),
        );

        match self.forward(&mut state, parts, body).await {
            Ok(response) => response,
            Err(err) => error_response(&err, &cors_headers),
        }
    }

    /// Run the hop loop until a response that is not followed arrives
    async fn forward(
        &self,
        state: &mut RequestState,
        mut parts: Parts,
        body: ProxyBody,
    ) -> Result<Response<ProxyBody>> {
        let mut debug_headers = HeaderMap::new();
        if let Ok(href) = HeaderValue::from_str(state.location().href()) {
            debug_headers.insert(X_REQUEST_URL, href);
        }

        let mut body = Some(body);
        loop {
            let upstream = state.upstream();
            let request = outbound_request(
                &parts,
                state.location(),
                upstream.as_ref(),
                body.take().unwrap_or_else(empty),
            )?;

            debug!(
                hop = state.redirect_count(),
                target = %state.location(),
                chained = upstream.is_some(),
                "Forwarding request"
            );
            let response = self
                .transport
                .send(state.location(), upstream.as_ref(), request)
                .await?;

            let status = response.status();
            let mut client_location = None;

            if is_redirect(status) {
                let redirect = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|raw| resolve_redirect(state.location(), raw));

                if let Some((resolved, next)) = redirect {
                    if is_followable(status) && state.follow(next) {
                        debug!(
                            status = status.as_u16(),
                            location = %resolved,
                            hop = state.redirect_count(),
                            "Following redirect"
                        );
                        let name = format!("x-cors-redirect-{}", state.redirect_count());
                        if let (Ok(name), Ok(value)) = (
                            HeaderName::from_bytes(name.as_bytes()),
                            HeaderValue::from_str(&format!("{} {}", status.as_u16(), resolved)),
                        ) {
                            debug_headers.insert(name, value);
                        }

                        parts.method = Method::GET;
                        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
                        parts.headers.remove(CONTENT_TYPE);

                        // Abandon this hop; its connection task logs the abort at debug
                        drop(response);
                        continue;
                    }

                    client_location = Some(format!("{}/{}", state.proxy_base_url(), resolved));
                }
            }

            return Ok(self.finish(
                state,
                response,
                debug_headers,
                client_location,
                &parts.method,
            ));
        }
    }

    /// Final response to the client: cookies stripped, debug headers added,
    /// CORS applied, body streamed through untouched
    fn finish(
        &self,
        state: &RequestState,
        response: Response<Incoming>,
        debug_headers: HeaderMap,
        client_location: Option<String>,
        method: &Method,
    ) -> Response<ProxyBody> {
        let (mut parts, body) = response.into_parts();
        let headers = &mut parts.headers;

        remove_hop_by_hop(headers);
        headers.remove(SET_COOKIE);
        headers.remove(SET_COOKIE2);

        if let Some(location) = client_location {
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    headers.insert(LOCATION, value);
                }
                Err(_) => warn!(location = %location, "Unable to rewrite redirect location"),
            }
        }

        if let Ok(href) = HeaderValue::from_str(state.location().href()) {
            headers.insert(X_FINAL_URL, href);
        }
        headers.extend(debug_headers);

        self.cors.apply(headers, method, &mut HeaderMap::new());

        debug!(
            status = parts.status.as_u16(),
            redirects = state.redirect_count(),
            "Streaming upstream response"
        );
        Response::from_parts(parts, incoming(body))
    }

    /// Header rewrites applied once, before the first hop
    fn prepare_outbound(&self, headers: &mut HeaderMap, client_addr: SocketAddr) {
        for name in &self.remove_headers {
            headers.remove(name);
        }
        for (name, value) in &self.set_headers {
            headers.insert(name.clone(), value.clone());
        }
        if self.xfwd {
            append_forwarded(headers, client_addr);
        }
    }

    /// Help content for requests without a usable target
    async fn usage(&self, mut headers: HeaderMap) -> Response<ProxyBody> {
        match self.help.load().await {
            Ok(text) => {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(self.help.content_type()),
                );
                reply(StatusCode::NOT_FOUND, headers, full(text.to_string()))
            }
            Err(e) => {
                error!(path = %self.help.path().display(), error = %e, "Failed to read help file");
                reply(StatusCode::INTERNAL_SERVER_ERROR, headers, empty())
            }
        }
    }
}

/// Outbound request for one hop
fn outbound_request(
    parts: &Parts,
    location: &TargetLocation,
    upstream: Option<&UpstreamProxy>,
    body: ProxyBody,
) -> Result<Request<ProxyBody>> {
    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(ProxyTransport::request_uri(location, upstream))
        .body(body)
        .map_err(|e| ProksyError::Http(format!("Invalid outbound request: {}", e)))?;

    let listed = connection_tokens(&parts.headers);
    let headers = request.headers_mut();
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) && !listed.contains(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.remove(ORIGIN);
    headers.remove(REFERER);

    let host = HeaderValue::from_str(&location.host())
        .map_err(|_| ProksyError::InvalidHost(location.hostname().to_string()))?;
    headers.insert(HOST, host);

    Ok(request)
}

fn reply(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// `no`: a caller able to read this does not need CORS
fn self_test() -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    reply(StatusCode::OK, headers, full("no"))
}

fn same_origin_redirect(mut headers: HeaderMap, href: &str) -> Response<ProxyBody> {
    headers.insert(VARY, HeaderValue::from_static("origin"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("private"));
    if let Ok(location) = HeaderValue::from_str(href) {
        headers.insert(LOCATION, location);
    }

    let mut response = reply(StatusCode::MOVED_PERMANENTLY, headers, empty());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Please use a direct request"));
    response
}

/// `https://<Host>` when the client reached us over TLS (per X-Forwarded-Proto)
fn proxy_base_url(headers: &HeaderMap) -> String {
    let secure = headers
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|proto| proto.trim_start().starts_with("https"));
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    format!("{}://{}", if secure { "https" } else { "http" }, host)
}

fn append_forwarded(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let port = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| host.rsplit_once(':'))
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or("80")
        .to_string();

    let values = [
        (X_FORWARDED_FOR, client_addr.ip().to_string()),
        (X_FORWARDED_PORT, port),
        (X_FORWARDED_PROTO, "http".to_string()),
    ];

    for (name, value) in values {
        let combined = match headers.get(&name).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{},{}", existing, value),
            _ => value,
        };
        if let Ok(combined) = HeaderValue::from_str(&combined) {
            headers.insert(name, combined);
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// 307/308 require replaying the method and body, which is not attempted
fn is_followable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303)
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let mut hop_by_hop = connection_tokens(headers);
    hop_by_hop.extend(
        headers
            .keys()
            .filter(|name| is_hop_by_hop_header(name.as_str()))
            .cloned(),
    );
    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Header names a `Connection` header declares as hop-by-hop
fn connection_tokens(headers: &HeaderMap) -> Vec<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("proxy-")
        || matches!(
            name.as_str(),
            "connection" | "keep-alive" | "te" | "trailers" | "transfer-encoding" | "upgrade"
        )
}
