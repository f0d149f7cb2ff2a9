//! Gateway lifecycle: bind, serve, shut down on ctrl-c.

use anyhow::{Context, Result};

use crate::config::AppConfig;

/// Serve the gateway until interrupted. Creates the runs and output roots
/// first so static mounts and uploads work from the first request.
pub async fn serve(config: AppConfig, host: &str, port: u16) -> Result<()> {
    config.ensure_roots()?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    let local = listener.local_addr().context("resolve bound address")?;
    tracing::info!(
        addr = %local,
        repo_root = %config.repo_root.display(),
        out_dir = %config.out_dir.display(),
        runs_dir = %config.runs_dir.display(),
        "gateway listening"
    );

    let app = super::router(config);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve gateway")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
