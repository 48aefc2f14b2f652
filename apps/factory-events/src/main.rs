use anyhow::{Context, Result};
use factory_events::config::Config;
use factory_events::{http, store};

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,factory_events=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    let event_store = store::connect(&config).await?;
    let app = http::router(http::HttpState::new(event_store, &config));

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(
        bind = %config.http_bind,
        store = ?config.store_backend,
        max_batch_size = config.max_batch_size,
        "factory-events HTTP listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    Ok(())
}
