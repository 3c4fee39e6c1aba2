//! stashd -- the cache service host process.
//!
//! Parses configuration from flags and environment, initializes
//! logging and metrics, then runs the server until SIGINT or SIGTERM.
//! Exits non-zero on invalid configuration or a listener bind failure.

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stash_server::{CacheServer, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate().context("invalid configuration")?;

    if let Some(port) = config.metrics_port {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(std::net::SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("install metrics exporter")?;
        info!(port, "metrics exporter listening");
    }

    let mut server = CacheServer::new(config);
    server.bind().await.context("bind client listener")?;
    server.serve(shutdown_signal()).await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("SIGINT received, shutting down"),
            _ = term.recv() => info!("SIGTERM received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("ctrl-c received, shutting down");
    }
}
