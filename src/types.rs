use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::model_loader::ModelInfo;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub text: String,
    pub label: String,
    pub score: f64,
    pub confidence_percentage: f64,
}

impl PredictionResponse {
    /// Picks the top-ranked class out of per-class probabilities.
    pub fn from_probabilities(text: String, labels: &[String], probs: &[f32]) -> Result<Self> {
        if probs.len() != labels.len() {
            bail!(
                "classifier returned {} scores for {} labels",
                probs.len(),
                labels.len()
            );
        }
        if let Some(bad) = probs.iter().find(|p| !(0.0..=1.0).contains(*p)) {
            bail!("classifier returned score {bad} outside [0, 1]");
        }

        let (index, score) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or_else(|| anyhow::anyhow!("classifier returned no scores"))?;

        let score = f64::from(score);
        Ok(Self {
            text,
            label: labels[index].clone(),
            score,
            confidence_percentage: confidence_percentage(score),
        })
    }
}

/// `score` as a percentage rounded to two decimal places.
pub fn confidence_percentage(score: f64) -> f64 {
    (score * 100.0 * 100.0).round() / 100.0
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub message: &'static str,
    pub model_loaded: bool,
    pub model_info: ModelInfoBody,
}

/// Serializes as the model info when loaded, `{}` otherwise.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ModelInfoBody {
    Loaded(ModelInfo),
    Empty {},
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
}
