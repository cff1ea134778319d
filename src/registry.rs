//! Fetches a versioned model artifact from the Hugging Face hub into a local
//! directory the server can load from.

use anyhow::{Context, Result, bail};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Files every artifact must provide.
const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];

/// Weight files, in order of preference. The first one found is used.
const WEIGHT_FILES: &[&str] = &["model.safetensors", "pytorch_model.bin"];

/// Tokenizer side files that are copied when the artifact has them.
const OPTIONAL_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.txt",
];

/// A `name:version` reference to an artifact in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub name: String,
    pub version: String,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let version = version.into();
        if name.is_empty() {
            bail!("artifact name must not be empty");
        }
        if version.is_empty() {
            bail!("artifact version must not be empty");
        }
        if name.contains(':') {
            bail!("artifact name {name:?} must not contain ':'");
        }
        Ok(Self { name, version })
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for ArtifactRef {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = s
            .rsplit_once(':')
            .with_context(|| format!("artifact reference {s:?} is not of the form name:version"))?;
        Self::new(name, version)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub api_key: String,
    /// Alternative hub endpoint, e.g. a self-hosted mirror.
    pub endpoint: Option<String>,
}

/// Downloads `artifact` and copies its files into `dest`, creating it if
/// needed. Returns the destination directory.
#[tracing::instrument(
    skip(config, artifact, dest),
    fields(artifact = %artifact, dest = %dest.display())
)]
pub async fn download(
    config: &RegistryConfig,
    artifact: &ArtifactRef,
    dest: &Path,
) -> Result<PathBuf> {
    let mut builder = ApiBuilder::new()
        .with_token(Some(config.api_key.clone()))
        .with_progress(false);
    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint.clone());
    }
    let api = builder.build().context("failed to initialize registry client")?;
    let repo = api.repo(Repo::with_revision(
        artifact.name.clone(),
        RepoType::Model,
        artifact.version.clone(),
    ));

    tokio::fs::create_dir_all(dest)
        .await
        .with_context(|| format!("failed to create {}", dest.display()))?;

    for file in REQUIRED_FILES {
        let cached = fetch(&repo, file).await?;
        install(&cached, dest, file).await?;
    }

    let mut weights = None;
    for file in WEIGHT_FILES {
        match fetch(&repo, file).await {
            Ok(cached) => {
                weights = Some((cached, *file));
                break;
            }
            Err(e) => tracing::debug!("{e:#}"),
        }
    }
    let Some((cached, file)) = weights else {
        bail!("artifact {artifact} has none of {}", WEIGHT_FILES.join(", "));
    };
    install(&cached, dest, file).await?;
    remove_stale_weights(dest, file).await?;

    for file in OPTIONAL_FILES {
        match fetch(&repo, file).await {
            Ok(cached) => install(&cached, dest, file).await?,
            Err(_) => tracing::debug!(file, "Optional file not present in artifact"),
        }
    }

    Ok(dest.to_path_buf())
}

async fn fetch(repo: &ApiRepo, file: &str) -> Result<PathBuf> {
    tracing::debug!(file, "Downloading");
    repo.get(file)
        .await
        .with_context(|| format!("failed to download {file}"))
}

async fn install(cached: &Path, dest: &Path, file: &str) -> Result<()> {
    let target = dest.join(file);
    tokio::fs::copy(cached, &target)
        .await
        .with_context(|| format!("failed to copy {file} to {}", target.display()))?;
    tracing::info!(file, "Installed");
    Ok(())
}

/// Deletes weight files other than `keep` left behind by an earlier download,
/// so the loader cannot pick them up next to a newer config.
async fn remove_stale_weights(dest: &Path, keep: &str) -> Result<()> {
    for file in WEIGHT_FILES.iter().filter(|file| **file != keep) {
        let path = dest.join(file);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::info!(file, "Removed stale weights"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", path.display()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_name_colon_version() {
        let artifact = ArtifactRef::new("acme/sentiment-bert", "v3").unwrap();
        assert_eq!(artifact.to_string(), "acme/sentiment-bert:v3");
    }

    #[test]
    fn parses_name_and_version() {
        let artifact: ArtifactRef = "acme/sentiment-bert:main".parse().unwrap();
        assert_eq!(artifact, ArtifactRef::new("acme/sentiment-bert", "main").unwrap());
    }

    #[test]
    fn rejects_incomplete_references() {
        assert!("acme/sentiment-bert".parse::<ArtifactRef>().is_err());
        assert!(":v1".parse::<ArtifactRef>().is_err());
        assert!("acme/sentiment-bert:".parse::<ArtifactRef>().is_err());
        assert!(ArtifactRef::new("a:b", "v1").is_err());
    }

    #[tokio::test]
    async fn install_copies_into_destination() {
        let cache = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let cached = cache.path().join("blob");
        std::fs::write(&cached, b"{\"model_type\": \"bert\"}").unwrap();

        install(&cached, dest.path(), "config.json").await.unwrap();

        let copied = std::fs::read_to_string(dest.path().join("config.json")).unwrap();
        assert_eq!(copied, "{\"model_type\": \"bert\"}");
    }

    #[tokio::test]
    async fn stale_weights_from_previous_version_are_removed() {
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("model.safetensors"), b"old").unwrap();
        std::fs::write(dest.path().join("pytorch_model.bin"), b"new").unwrap();

        remove_stale_weights(dest.path(), "pytorch_model.bin").await.unwrap();

        assert!(!dest.path().join("model.safetensors").exists());
        assert!(dest.path().join("pytorch_model.bin").exists());
    }

    #[tokio::test]
    async fn removing_absent_weights_is_fine() {
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("model.safetensors"), b"new").unwrap();

        remove_stale_weights(dest.path(), "model.safetensors").await.unwrap();

        assert!(dest.path().join("model.safetensors").exists());
    }
}
