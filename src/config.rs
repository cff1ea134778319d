use anyhow::Context;
use clap::Parser;
use std::path::Path;

use crate::registry::{ArtifactRef, RegistryConfig};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Use PyTorch weights instead of safetensors
    #[arg(long, env = "USE_PTH")]
    pub use_pth: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Maximum sequence length allowed, longer inputs are truncated
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "512")]
    pub max_sequence_length: usize,

    /// Number of blocking worker threads allowed to run inference at once
    #[arg(long, env = "INFERENCE_WORKERS", default_value = "4")]
    pub inference_workers: usize,
}

/// Options for the `fetch-model` tool.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Download the model artifact the server loads", long_about = None)]
pub struct FetchConfig {
    /// Registry API key
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub api_key: String,

    /// Registered model name
    #[arg(long, env = "MODEL_NAME", required_unless_present = "artifact")]
    pub model_name: Option<String>,

    /// Model version tag or revision
    #[arg(long = "model-version", env = "VERSION", required_unless_present = "artifact")]
    pub model_version: Option<String>,

    /// Full `name:version` reference, takes precedence over MODEL_NAME and VERSION
    #[arg(long)]
    pub artifact: Option<String>,

    /// Registry endpoint, defaults to the public hub
    #[arg(long, env = "HF_ENDPOINT")]
    pub endpoint: Option<String>,
}

impl FetchConfig {
    pub fn artifact_ref(&self) -> anyhow::Result<ArtifactRef> {
        match (&self.artifact, &self.model_name, &self.model_version) {
            (Some(reference), _, _) => reference.parse(),
            (None, Some(name), Some(version)) => ArtifactRef::new(name.as_str(), version.as_str()),
            _ => anyhow::bail!("MODEL_NAME and VERSION must both be set"),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            api_key: self.api_key.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Loads `KEY=value` pairs from an env file into the process environment.
/// Variables that are already set keep their values. Returns whether the
/// file existed.
pub fn load_env_file(path: &Path) -> anyhow::Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    dotenvy::from_path(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(true)
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_all_interfaces_on_8000() {
        let config = Config::try_parse_from(["sentiment-server"]).unwrap();
        assert_eq!(config.server_address(), "0.0.0.0:8000");
        assert_eq!(config.max_sequence_length, 512);
        assert_eq!(config.inference_workers, 4);
        assert!(!config.cpu_only);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "sentiment-server",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--cpu-only",
            "--inference-workers",
            "2",
        ])
        .unwrap();
        assert_eq!(config.server_address(), "127.0.0.1:9000");
        assert!(config.cpu_only);
        assert_eq!(config.inference_workers, 2);
    }

    #[test]
    fn fetch_builds_reference_from_name_and_version() {
        let config = FetchConfig::try_parse_from([
            "fetch-model",
            "--api-key",
            "secret",
            "--model-name",
            "acme/sentiment-bert",
            "--model-version",
            "v2",
        ])
        .unwrap();
        assert_eq!(
            config.artifact_ref().unwrap().to_string(),
            "acme/sentiment-bert:v2"
        );
        assert_eq!(config.registry_config().api_key, "secret");
    }

    #[test]
    fn fetch_accepts_full_reference() {
        let config = FetchConfig::try_parse_from([
            "fetch-model",
            "--api-key",
            "secret",
            "--artifact",
            "acme/sentiment-bert:main",
        ])
        .unwrap();
        let artifact = config.artifact_ref().unwrap();
        assert_eq!(artifact.name, "acme/sentiment-bert");
        assert_eq!(artifact.version, "main");
    }

    #[test]
    fn fetch_reference_takes_precedence_over_name() {
        let config = FetchConfig::try_parse_from([
            "fetch-model",
            "--api-key",
            "secret",
            "--artifact",
            "acme/sentiment-bert:main",
            "--model-name",
            "other",
        ])
        .unwrap();
        assert_eq!(config.artifact_ref().unwrap().name, "acme/sentiment-bert");
    }

    #[test]
    fn env_file_fills_unset_variables_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "FETCH_CONFIG_TEST_MODEL_NAME=acme/sentiment-bert\nPATH=/nowhere\n",
        )
        .unwrap();

        assert!(load_env_file(&path).unwrap());
        assert_eq!(
            std::env::var("FETCH_CONFIG_TEST_MODEL_NAME").unwrap(),
            "acme/sentiment-bert"
        );
        assert_ne!(std::env::var("PATH").unwrap(), "/nowhere");
    }

    #[test]
    fn missing_env_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!load_env_file(&dir.path().join(".env")).unwrap());
    }
}
