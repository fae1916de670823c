//! Discovery Registry entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lattice_mesh::catalog::consul::ConsulCatalog;
use lattice_mesh::config::DiscoverySettings;
use lattice_mesh::discovery::{router, DiscoveryService};
use lattice_mesh::messaging::connect_publisher;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();

    let settings = DiscoverySettings::load()?;
    info!(
        port = settings.port,
        consul = %settings.consul_address,
        "discovery server starting"
    );

    let catalog = Arc::new(ConsulCatalog::new(&settings.consul_address)?);
    let publisher = connect_publisher(settings.rabbitmq_url.as_deref()).await?;

    let service = Arc::new(DiscoveryService::new(catalog, publisher));
    let app = router(service);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down discovery server");
        let _ = shutdown_tx.send(true);
    });

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "discovery server listening");

    let mut serve_rx = shutdown_rx.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = serve_rx.changed().await;
    });

    let mut grace_rx = shutdown_rx;
    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = grace_rx.changed().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        } => warn!("graceful shutdown timed out"),
    }

    info!("discovery server shut down");
    Ok(())
}

/// Completes on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
