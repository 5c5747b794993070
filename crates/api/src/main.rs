use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use library_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    library_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(library_api::app::services::build_services(&config).await?);

    let shutdown = CancellationToken::new();
    let dispatcher = services.start_dispatcher(&shutdown);

    let app = library_api::app::build_app(services.clone());
    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = services.backend_name(),
        "listening"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await
        .context("http server failed")?;

    tracing::info!("shutting down outbox dispatcher");
    dispatcher.shutdown().await;
    Ok(())
}
