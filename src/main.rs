//! Proksy - Entry Point
//!
//! Starts the CORS proxy with graceful shutdown support.

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proksy::{Config, ProxyServer};

#[tokio::main]
async fn main() -> proksy::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("proksy={}", config.log.level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("Starting Proksy");
    info!(
        max_redirects = config.cors.max_redirects,
        redirect_same_origin = config.cors.redirect_same_origin,
        help_file = %config.cors.help_file.display(),
        "Configuration loaded"
    );

    let proxy_addr = config.proxy_addr();
    let proxy_server = ProxyServer::new(config)?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy started on {}", proxy_addr);

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Proksy stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
