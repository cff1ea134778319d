use anyhow::{Result, bail};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::engine::{Classifier, Engine};
use crate::pooled_engine::PooledEngine;
use crate::transformer_engine::{self, TransformerConfig};

/// Directory the fetch tool downloads the model artifact into.
pub const MODEL_DIR: &str = "model";

pub const NUM_LABELS: usize = 2;

/// Output class names, in class-index order.
pub const LABELS: [&str; NUM_LABELS] = ["Negative", "Positive"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    pub num_labels: usize,
    pub labels: Vec<String>,
}

impl ModelInfo {
    pub fn new(model_path: &Path) -> Self {
        Self {
            model_path: model_path.display().to_string(),
            num_labels: NUM_LABELS,
            labels: LABELS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A fully loaded classifier and the metadata describing it.
pub struct ModelHandle {
    pub engine: Arc<dyn Engine + Send + Sync>,
    pub info: ModelInfo,
}

impl ModelHandle {
    pub fn new(classifier: Arc<dyn Classifier>, model_path: &Path, workers: usize) -> Self {
        Self {
            engine: Arc::new(PooledEngine::new(classifier, workers)),
            info: ModelInfo::new(model_path),
        }
    }
}

/// Outcome of the startup load. Fixed for the lifetime of the process.
pub enum ModelState {
    Ready(ModelHandle),
    Degraded { reason: String },
}

impl ModelState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn handle(&self) -> Option<&ModelHandle> {
        match self {
            Self::Ready(handle) => Some(handle),
            Self::Degraded { .. } => None,
        }
    }

    /// Why the model is unavailable, if it is.
    pub fn degraded_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Degraded { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
    pub inference_workers: usize,
}

impl From<&Config> for LoaderConfig {
    fn from(config: &Config) -> Self {
        Self {
            use_pth: config.use_pth,
            cpu: config.cpu_only,
            max_sequence_length: config.max_sequence_length,
            inference_workers: config.inference_workers,
        }
    }
}

/// Loads the classifier at `model_path`.
///
/// Never fails: any error is logged and turned into [`ModelState::Degraded`]
/// so the server can still come up and report what went wrong.
pub fn load(model_path: &Path, config: &LoaderConfig) -> ModelState {
    match try_load(model_path, config) {
        Ok(handle) => {
            tracing::info!(model_path = %handle.info.model_path, "Model loaded successfully!");
            ModelState::Ready(handle)
        }
        Err(e) => {
            let reason = format!("{e:#}");
            tracing::error!("Error loading model: {reason}");
            ModelState::Degraded { reason }
        }
    }
}

/// Runs `load` on the blocking pool. A panic inside it degrades the service
/// like any other load failure instead of taking the process down.
pub async fn load_blocking<F>(load: F) -> ModelState
where
    F: FnOnce() -> ModelState + Send + 'static,
{
    match tokio::task::spawn_blocking(load).await {
        Ok(state) => state,
        Err(e) => {
            let reason = format!("model loader panicked: {e}");
            tracing::error!("Error loading model: {reason}");
            ModelState::Degraded { reason }
        }
    }
}

fn try_load(model_path: &Path, config: &LoaderConfig) -> Result<ModelHandle> {
    if model_path.as_os_str().is_empty() {
        bail!("Model not found in any expected location");
    }

    let transformer_config = TransformerConfig {
        use_pth: config.use_pth,
        cpu: config.cpu,
        max_sequence_length: config.max_sequence_length,
        labels: LABELS.iter().map(ToString::to_string).collect(),
    };
    let classifier = transformer_engine::load_classifier(model_path, &transformer_config)?;

    Ok(ModelHandle::new(
        classifier,
        model_path,
        config.inference_workers,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader_config() -> LoaderConfig {
        LoaderConfig {
            use_pth: false,
            cpu: true,
            max_sequence_length: 512,
            inference_workers: 1,
        }
    }

    struct Constant;

    impl Classifier for Constant {
        fn classify(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![0.25, 0.75])
        }
    }

    #[test]
    fn model_info_describes_binary_classifier() {
        let info = ModelInfo::new(Path::new(MODEL_DIR));
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({
                "model_path": "model",
                "num_labels": 2,
                "labels": ["Negative", "Positive"],
            })
        );
    }

    #[test]
    fn empty_path_is_degraded() {
        let state = load(Path::new(""), &loader_config());
        assert!(!state.is_loaded());
        assert_eq!(
            state.degraded_reason(),
            Some("Model not found in any expected location")
        );
    }

    #[test]
    fn missing_directory_is_degraded_with_reason() {
        let dir = tempfile::tempdir().unwrap();
        let state = load(&dir.path().join(MODEL_DIR), &loader_config());
        assert!(state.handle().is_none());
        assert!(state.degraded_reason().unwrap().contains("is not a directory"));
    }

    #[test]
    fn broken_artifact_is_degraded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "not json").unwrap();
        let state = load(dir.path(), &loader_config());
        assert!(!state.is_loaded());
        assert!(state.degraded_reason().unwrap().contains("failed to parse"));
    }

    #[tokio::test]
    async fn panicking_loader_degrades_instead_of_crashing() {
        let state = load_blocking(|| panic!("tokenizer blew up")).await;
        assert!(!state.is_loaded());
        assert!(
            state
                .degraded_reason()
                .unwrap()
                .starts_with("model loader panicked")
        );
    }

    #[tokio::test]
    async fn blocking_load_passes_state_through() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join(MODEL_DIR);
        let state = load_blocking(move || load(&missing, &loader_config())).await;
        assert!(state.degraded_reason().unwrap().contains("is not a directory"));
    }

    #[tokio::test]
    async fn ready_state_exposes_handle() {
        let state = ModelState::Ready(ModelHandle::new(
            Arc::new(Constant),
            Path::new(MODEL_DIR),
            1,
        ));
        assert!(state.is_loaded());
        assert_eq!(state.degraded_reason(), None);

        let handle = state.handle().unwrap();
        assert_eq!(handle.info.labels, vec!["Negative", "Positive"]);
        let probs = handle.engine.classify("anything".to_string()).await.unwrap();
        assert_eq!(probs, vec![0.25, 0.75]);
    }
}
