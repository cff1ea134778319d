use clap::Parser;
use std::path::Path;

use sentiment_server::config::{self, FetchConfig};
use sentiment_server::model_loader::MODEL_DIR;
use sentiment_server::registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sentiment_server=debug".into()),
        )
        .init();

    if config::load_env_file(Path::new(".env"))? {
        tracing::debug!("Loaded environment from .env");
    }

    let config = FetchConfig::parse();
    let artifact = config.artifact_ref()?;
    tracing::info!("Model URI: {}", artifact);

    match registry::download(&config.registry_config(), &artifact, Path::new(MODEL_DIR)).await {
        Ok(dir) => {
            tracing::info!("Model downloaded successfully to: {}", dir.display());
            Ok(())
        }
        Err(e) => {
            tracing::error!("Error downloading model: {e:#}");
            Err(e)
        }
    }
}
