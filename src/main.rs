//! tunnel-ingress
//!
//! Dynamic TCP front door with SNI routing.
//!
//! This service:
//! - Accepts TCP connections on the public listen address
//! - Extracts the SNI from the TLS ClientHello (handling PROXY protocol and
//!   PostgreSQL SSLRequest preludes)
//! - Lazily launches one `cloudflared access tcp` helper per backend hostname
//! - Proxies connection bytes to the helper's loopback port verbatim

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tunnel_ingress::{Config, LogFormat, ManagerConfig, ProxyListener, TunnelManager};

/// Bounded wait for tunnel helpers to be reaped on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    info!(
        listen_addr = %config.listen_addr,
        idle_timeout_s = config.idle_timeout.as_secs(),
        startup_timeout_s = config.startup_timeout.as_secs(),
        port_range_start = config.port_range_start,
        port_range_end = config.port_range_end,
        max_restarts = config.max_restarts,
        "configuration loaded"
    );

    let manager = Arc::new(TunnelManager::new(ManagerConfig::from(&config)));
    let listener = ProxyListener::bind(
        config.listen_addr,
        Arc::clone(&manager),
        config.read_hello_timeout,
    )
    .await
    .with_context(|| format!("failed to listen on {}", config.listen_addr))?;

    info!(listen_addr = %listener.local_addr()?, "tunnel ingress listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received signal, shutting down");
        let _ = signal_tx.send(true);
    });

    if let Err(err) = listener.run(shutdown_rx).await {
        warn!(error = %err, "accept loop exited with error");
    }
    // Idempotent: covers the fatal-accept-error path where no signal fired.
    let _ = shutdown_tx.send(true);

    manager.shutdown(SHUTDOWN_GRACE).await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
