use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use batchrelay_infra::{DrainOutcome, RelayConfig, ShutdownCoordinator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    batchrelay_observability::init();

    let config = RelayConfig::from_env().context("invalid configuration")?;
    info!(?config, "configuration loaded");

    let runtime = batchrelay_api::app::services::build_services(&config).await?;
    let shutdown = runtime.services.shutdown().clone();
    let scheduler = runtime.scheduler.clone().spawn();

    let app = batchrelay_api::app::build_app(runtime.services.clone());
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("http server failed")?;

    // Stops new claims; deliveries already running keep their guards.
    shutdown.signal_shutdown();
    match shutdown.drain(config.shutdown_timeout).await {
        DrainOutcome::Drained => {
            if tokio::time::timeout(Duration::from_secs(5), scheduler).await.is_err() {
                warn!("retry scheduler did not stop in time");
            }
        }
        DrainOutcome::TimedOut { .. } => scheduler.abort(),
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: ShutdownCoordinator) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.wait_for_shutdown() => {},
    }

    info!("shutdown signal received");
    shutdown.signal_shutdown();
}
