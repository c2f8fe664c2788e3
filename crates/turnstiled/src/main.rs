use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use turnstile_core::{DebounceCache, EventStore, GalleryStore, OnnxExtractor};

mod config;
mod engine;
mod http;
mod service;

#[cfg(test)]
mod test_support;

use config::Config;
use http::AppState;
use service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "turnstiled starting");

    let config = Config::from_env();

    let detector_path = config.detector_model_path();
    let recognizer_path = config.recognizer_model_path();
    let extractor = OnnxExtractor::load(&detector_path, &recognizer_path).with_context(|| {
        format!(
            "failed to load models from {} (expected det_10g.onnx and w600k_r50.onnx)",
            config.model_dir.display()
        )
    })?;
    tracing::info!(model_dir = %config.model_dir.display(), "models loaded");

    let engine = engine::spawn_engine(extractor, config.extract_timeout)
        .context("failed to start extraction engine")?;

    let service = Service::new(
        GalleryStore::open(&config.gallery_path),
        EventStore::open(&config.events_path),
        DebounceCache::new(config.debounce_window),
        engine,
    );

    let state = AppState {
        service: Arc::new(service),
        default_threshold: config.match_threshold,
        default_camera: config.default_camera.clone(),
    };
    let app = http::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    tracing::info!(
        bind = %config.bind,
        debounce_secs = config.debounce_window.as_secs_f64(),
        threshold = config.match_threshold,
        "turnstiled ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("turnstiled shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
