//! Nimbus API server entry point.
//!
//! Serves the compute API over HTTP until interrupted (or idle, when
//! `NIMBUS_IDLE_SECS` is set), then tears down every instance.

use nimbus_api::{http, ApiConfig, NimbusServer};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How often instances whose hypervisor exited are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("nimbus_api=info".parse()?)
                .add_directive("nimbus_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Nimbus API server");

    // Load configuration from environment
    let config = ApiConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Validate configuration (warn-only to support development environments)
    config.validate_warn();

    let server = NimbusServer::from_config(&config)?;
    server.registry().config().validate()?;

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Get handle for cleanup
    let cleanup_registry = server.registry_arc();

    // HTTP transport
    let http_server = server.clone();
    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(http_server, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    // Periodic reaper for instances whose process died
    let reap_registry = server.registry_arc();
    let mut reap_shutdown = shutdown_tx.subscribe();
    let reaper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reap_registry.reap_exited().await;
                }
                _ = reap_shutdown.recv() => break,
            }
        }
    });

    tracing::info!(http_addr = %config.http_addr, "Server ready");

    // Wait for shutdown signal or idleness
    let idle = async {
        match config.idle_timeout {
            Some(timeout) => server.idle(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
        }
        _ = idle => {
            tracing::info!("Idle timeout reached, cleaning up...");
        }
    }

    // Broadcast shutdown to all tasks
    let _ = shutdown_tx.send(());

    // Let in-flight requests finish so no create lands after teardown
    let _ = http_handle.await;
    let _ = reaper.await;

    // Tear down all managed instances, including any still being set up
    cleanup_registry.teardown_all().await;
    tracing::info!("All instances cleaned up");

    tracing::info!("Server shutdown complete");
    Ok(())
}
