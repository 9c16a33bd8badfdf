//! Upstream transport
//!
//! Opens the connection for one hop (directly or through a chained proxy,
//! plain or TLS) and sends a single HTTP/1.1 request over it.

use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, CONTENT_LENGTH, PROXY_AUTHORIZATION};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, instrument};

use crate::config::ProxyServerConfig;
use crate::error::{ProksyError, Result};
use crate::proxy::location::TargetLocation;
use crate::proxy::upstream::{format_tcp_addr, UpstreamProtocol, UpstreamProxy};
use crate::proxy::ProxyBody;

/// Byte stream to the origin (or a tunnel to it)
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Proxy transport handler
///
/// Shared by all requests; holds no per-request state.
#[derive(Clone)]
pub struct ProxyTransport {
    tls: TlsConnector,
    connect_timeout: Duration,
    request_timeout: Duration,
    body_limit: Option<u64>,
}

impl ProxyTransport {
    /// Transport trusting the webpki root certificates
    pub fn new(config: &ProxyServerConfig) -> Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut tls_config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProksyError::InvalidConfig(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self::with_tls_config(Arc::new(tls_config), config))
    }

    pub fn with_tls_config(tls_config: Arc<ClientConfig>, config: &ProxyServerConfig) -> Self {
        Self {
            tls: TlsConnector::from(tls_config),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            body_limit: config.body_limit(),
        }
    }

    /// Request-target for the outbound request line. Plain HTTP through an
    /// HTTP proxy uses the absolute form; everything else is tunnelled or
    /// direct and uses the origin form.
    pub fn request_uri(target: &TargetLocation, upstream: Option<&UpstreamProxy>) -> String {
        if is_absolute_form(target, upstream) {
            target.href().to_string()
        } else {
            target.path().to_string()
        }
    }

    /// Reject a declared body larger than the configured ceiling
    pub fn check_content_length(&self, request: &Request<ProxyBody>) -> Result<()> {
        let Some(limit) = self.body_limit else {
            return Ok(());
        };
        let declared = request
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        match declared {
            Some(length) if length > limit => Err(ProksyError::PayloadTooLarge { limit }),
            _ => Ok(()),
        }
    }

    /// Send one hop and wait for the response headers. The body is streamed
    /// by the caller; dropping the response aborts the hop.
    #[instrument(skip_all, fields(target = %target, method = %request.method()))]
    pub async fn send(
        &self,
        target: &TargetLocation,
        upstream: Option<&UpstreamProxy>,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>> {
        self.check_content_length(&request)?;

        let (mut parts, body) = request.into_parts();
        if is_absolute_form(target, upstream) {
            if let Some(credentials) = upstream.and_then(proxy_credentials) {
                parts.headers.insert(PROXY_AUTHORIZATION, credentials);
            }
        }
        let body = match self.body_limit {
            Some(limit) => Limited::new(body, limit as usize).boxed(),
            None => body,
        };
        let request = Request::from_parts(parts, body);

        let stream = self.connect(target, upstream).await?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|e| ProksyError::Http(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            // Hops abandoned for a redirect end here with an abort error
            if let Err(e) = conn.await {
                debug!("Upstream connection ended: {}", e);
            }
        });

        timeout(self.request_timeout, sender.send_request(request))
            .await
            .map_err(|_| ProksyError::Timeout)?
            .map_err(|e| self.map_send_error(e))
    }

    fn map_send_error(&self, err: hyper::Error) -> ProksyError {
        match self.body_limit {
            Some(limit) if exceeds_body_limit(&err) => ProksyError::PayloadTooLarge { limit },
            _ => ProksyError::Http(format!("Request failed: {}", err)),
        }
    }

    /// Open the byte stream for a hop
    async fn connect(
        &self,
        target: &TargetLocation,
        upstream: Option<&UpstreamProxy>,
    ) -> Result<Box<dyn ProxyConnection>> {
        let host = target.hostname();
        let port = target.port_or_default();

        let stream = match upstream {
            None => self.connect_direct(target).await?,
            Some(proxy) if is_absolute_form(target, upstream) => {
                debug!("Sending through HTTP proxy at {}", proxy.addr());
                timeout(self.connect_timeout, TcpStream::connect(proxy.addr()))
                    .await
                    .map_err(|_| ProksyError::Timeout)?
                    .map_err(|e| {
                        ProksyError::UpstreamProxy(format!(
                            "TCP connect to {} failed: {}",
                            proxy.addr(),
                            e
                        ))
                    })?
            }
            Some(proxy) => {
                debug!("Tunnelling through upstream proxy at {}", proxy.addr());
                let tunnel = async {
                    match proxy.protocol {
                        UpstreamProtocol::Http => connect_via_http_proxy(proxy, host, port).await,
                        UpstreamProtocol::Socks5 => {
                            connect_via_socks5_proxy(proxy, host, port).await
                        }
                    }
                };
                timeout(self.connect_timeout, tunnel)
                    .await
                    .map_err(|_| ProksyError::Timeout)?
                    .map_err(|e| {
                        ProksyError::UpstreamProxy(format!(
                            "Tunnel through {} to {} failed: {}",
                            proxy.addr(),
                            format_tcp_addr(host, port),
                            e
                        ))
                    })?
            }
        };

        if target.is_https() {
            Ok(Box::new(self.tls_handshake(host, stream).await?))
        } else {
            Ok(Box::new(stream))
        }
    }

    /// Resolve and dial the origin. Resolution failures and refused
    /// connections are reported separately from other transport errors.
    async fn connect_direct(&self, target: &TargetLocation) -> Result<TcpStream> {
        let url = target.href().to_string();
        let host = target.hostname();
        let port = target.port_or_default();

        let addrs: Vec<_> = match timeout(self.connect_timeout, lookup_host((host, port))).await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                return Err(ProksyError::HostUnresolvable {
                    url,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ProksyError::HostUnresolvable {
                    url,
                    reason: "lookup timed out".to_string(),
                })
            }
        };
        if addrs.is_empty() {
            return Err(ProksyError::HostUnresolvable {
                url,
                reason: "no addresses".to_string(),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    debug!(%addr, "Connected to upstream");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => last_error = Some("connection timed out".to_string()),
            }
        }

        Err(ProksyError::UpstreamUnreachable {
            url,
            reason: last_error.unwrap_or_else(|| "no addresses".to_string()),
        })
    }

    async fn tls_handshake(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ProksyError::Tls(format!("invalid server name for TLS: {}", host)))?;

        timeout(self.connect_timeout, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| ProksyError::Timeout)?
            .map_err(|e| ProksyError::Tls(format!("TLS handshake with {} failed: {}", host, e)))
    }
}

fn is_absolute_form(target: &TargetLocation, upstream: Option<&UpstreamProxy>) -> bool {
    matches!(upstream, Some(proxy) if proxy.protocol == UpstreamProtocol::Http) && !target.is_https()
}

fn proxy_credentials(proxy: &UpstreamProxy) -> Option<HeaderValue> {
    let username = proxy.username.as_ref()?;
    let password = proxy.password.as_deref().unwrap_or("");
    let encoded = BASE64.encode(format!("{}:{}", username, password));
    HeaderValue::from_str(&format!("Basic {}", encoded)).ok()
}

fn exceeds_body_limit(err: &hyper::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

async fn connect_via_http_proxy(
    proxy: &UpstreamProxy,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect(proxy.addr()).await?;

    let authority = format_tcp_addr(target_host, target_port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(credentials) = proxy_credentials(proxy) {
        request.push_str("Proxy-Authorization: ");
        request.push_str(credentials.to_str()?);
        request.push_str("\r\n");
    }

    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await?;
    if n == 0 {
        anyhow::bail!("empty CONNECT response");
    }

    let response_str = String::from_utf8_lossy(&response[..n]);
    if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
        anyhow::bail!(
            "CONNECT failed: {}",
            response_str.lines().next().unwrap_or("Unknown error")
        );
    }

    Ok(stream)
}

async fn connect_via_socks5_proxy(
    proxy: &UpstreamProxy,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect(proxy.addr()).await?;

    let stream = match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) => {
            Socks5Stream::connect_with_password_and_socket(
                socket,
                (target_host, target_port),
                username,
                password,
            )
            .await?
        }
        _ => Socks5Stream::connect_with_socket(socket, (target_host, target_port)).await?,
    };

    Ok(stream.into_inner())
}
