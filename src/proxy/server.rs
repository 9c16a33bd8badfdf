//! Proxy server implementation using hyper
//!
//! Accepts client connections and hands every request to the handler.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::{Config, ProxyServerConfig};
use crate::error::{ProksyError, Result};
use crate::proxy::handler::{InitialRequestHook, ProxyHandler};
use crate::proxy::incoming;
use crate::proxy::upstream::{EnvProxyResolver, UpstreamResolver};

/// Proxy server
pub struct ProxyServer {
    config: ProxyServerConfig,
    handler: Arc<ProxyHandler>,
}

impl ProxyServer {
    /// Create a proxy server with the environment-driven upstream resolver
    pub fn new(config: Config) -> Result<Self> {
        ProxyServerBuilder::new(config).build()
    }

    /// Run the proxy server
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| {
                ProksyError::InvalidConfig(format!("Invalid proxy server address: {}", e))
            })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let handler = self.handler.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    client_addr,
                                    handler,
                                ).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        handler: Arc<ProxyHandler>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = handler.clone();

            async move {
                let response = handler.handle(req.map(incoming), client_addr).await;
                Ok::<_, Infallible>(response)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .await?;

        Ok(())
    }
}

/// Builder for creating a proxy server
pub struct ProxyServerBuilder {
    config: Config,
    resolver: Option<Arc<dyn UpstreamResolver>>,
    hook: Option<Arc<dyn InitialRequestHook>>,
}

impl ProxyServerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            resolver: None,
            hook: None,
        }
    }

    /// Replace the default `*_proxy` environment lookup
    pub fn resolver(mut self, resolver: Arc<dyn UpstreamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn InitialRequestHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<ProxyServer> {
        let resolver = self.resolver.unwrap_or_else(|| {
            let resolver = EnvProxyResolver::from_env();
            if !resolver.is_empty() {
                info!("Upstream proxy settings found in environment");
            }
            Arc::new(resolver)
        });

        let mut handler = ProxyHandler::new(&self.config.proxy, &self.config.cors, resolver)?;
        if let Some(hook) = self.hook {
            handler = handler.with_hook(hook);
        }

        Ok(ProxyServer {
            config: self.config.proxy,
            handler: Arc::new(handler),
        })
    }
}
