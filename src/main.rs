use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use clap::Parser;
use std::path::Path;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use sentiment_server::config::Config;
use sentiment_server::model_loader::{self, LoaderConfig, MODEL_DIR};
use sentiment_server::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sentiment_server=debug".into()),
        )
        .init();

    let config = Config::parse();
    tracing::info!("Starting sentiment server with config: {:?}", config);

    let loader_config = LoaderConfig::from(&config);
    tracing::info!("Loading model from {}...", MODEL_DIR);
    let model_state = model_loader::load_blocking(move || {
        model_loader::load(Path::new(MODEL_DIR), &loader_config)
    })
    .await;
    if !model_state.is_loaded() {
        tracing::error!("Failed to load model on startup, serving in degraded mode");
    }

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let app = routes::router(AppState::new(model_state))
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server_address()).await?;
    tracing::info!("Server running on http://{}", config.server_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
