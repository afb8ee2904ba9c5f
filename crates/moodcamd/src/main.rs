use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moodcam_core::messages::MessageCatalog;
use moodcamd::engine;
use moodcamd::routes::{self, AppState};
use moodcamd::session::SessionStore;
use moodcamd::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("moodcamd starting");

    let config = Config::from_env();

    let pipeline = engine::build_pipeline(&config)?;
    let handle = engine::spawn(pipeline);

    let catalog = match &config.messages_file {
        Some(path) => MessageCatalog::with_overrides(path),
        None => MessageCatalog::embedded(),
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .build()?;

    let state = AppState {
        engine: handle,
        sessions: Arc::new(SessionStore::new(Duration::from_secs(
            config.session_ttl_secs,
        ))),
        catalog: Arc::new(catalog),
        http,
        max_fetch_bytes: config.max_fetch_bytes,
    };
    let app = routes::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "moodcamd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("moodcamd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown signal");
    }
}
