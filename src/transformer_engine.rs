use anyhow::{Context, Result, bail};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::ops::softmax;
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::debertav2::{
    Config as DebertaV2Config, DebertaV2SeqClassificationModel, Id2Label,
};
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{Tokenizer, TruncationParams};

use crate::engine::Classifier;

#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
    /// Names of the output classes, in class-index order.
    pub labels: Vec<String>,
}

/// The subset of a Hugging Face `config.json` needed to pick an architecture.
#[derive(Debug, Deserialize)]
struct ModelManifest {
    model_type: Option<String>,
    hidden_size: Option<usize>,
    /// DistilBERT's name for the hidden size.
    dim: Option<usize>,
    num_labels: Option<usize>,
    id2label: Option<HashMap<String, String>>,
}

/// Architectures with a sequence-classification head we know how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Architecture {
    DebertaV2,
    Bert,
    DistilBert,
}

impl Architecture {
    fn from_model_type(model_type: Option<&str>) -> Result<Self> {
        match model_type {
            Some("deberta-v2") => Ok(Self::DebertaV2),
            Some("bert") => Ok(Self::Bert),
            Some("distilbert") => Ok(Self::DistilBert),
            other => bail!("unsupported model_type {other:?}"),
        }
    }
}

impl ModelManifest {
    fn num_labels(&self) -> Option<usize> {
        self.id2label.as_ref().map(HashMap::len).or(self.num_labels)
    }
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if metal_is_available() {
        tracing::info!("Using metal acceleration");
        Ok(Device::new_metal(0)?)
    } else if cuda_is_available() {
        tracing::info!("Using CUDA GPU acceleration");
        Ok(Device::new_cuda(0)?)
    } else {
        tracing::info!(
            "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
        );
        Ok(Device::Cpu)
    }
}

/// Weight file formats a checkpoint can ship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WeightFormat {
    Safetensors,
    Pth,
}

impl WeightFormat {
    fn file_name(self) -> &'static str {
        match self {
            Self::Safetensors => "model.safetensors",
            Self::Pth => "pytorch_model.bin",
        }
    }
}

/// Picks the weight file to load. `use_pth` forces `pytorch_model.bin`;
/// otherwise safetensors wins and PyTorch weights are the fallback.
fn resolve_weights(model_dir: &Path, use_pth: bool) -> Result<(PathBuf, WeightFormat)> {
    let candidates: &[WeightFormat] = if use_pth {
        &[WeightFormat::Pth]
    } else {
        &[WeightFormat::Safetensors, WeightFormat::Pth]
    };
    candidates
        .iter()
        .map(|format| (model_dir.join(format.file_name()), *format))
        .find(|(path, _)| path.is_file())
        .with_context(|| {
            let names: Vec<_> = candidates.iter().map(|f| f.file_name()).collect();
            format!(
                "Model weights not found in {}, looked for {}",
                model_dir.display(),
                names.join(", ")
            )
        })
}

/// Architecture config parsed out of `config.json`, plus the hidden size
/// the classifier head needs where the architecture does not carry one.
enum ArchitectureConfig {
    DebertaV2(DebertaV2Config),
    Bert(BertConfig, usize),
    DistilBert(DistilBertConfig, usize),
}

impl ArchitectureConfig {
    fn parse(
        architecture: Architecture,
        manifest: &ModelManifest,
        raw_config: &str,
        config_filename: &Path,
    ) -> Result<Self> {
        let context = || {
            format!(
                "failed to parse {} as a {architecture:?} config",
                config_filename.display()
            )
        };
        let parsed = match architecture {
            Architecture::DebertaV2 => {
                Self::DebertaV2(serde_json::from_str(raw_config).with_context(context)?)
            }
            Architecture::Bert => {
                let hidden_size = manifest
                    .hidden_size
                    .context("config.json is missing hidden_size")?;
                Self::Bert(
                    serde_json::from_str(raw_config).with_context(context)?,
                    hidden_size,
                )
            }
            Architecture::DistilBert => {
                let dim = manifest.dim.context("config.json is missing dim")?;
                Self::DistilBert(serde_json::from_str(raw_config).with_context(context)?, dim)
            }
        };
        Ok(parsed)
    }
}

/// Builds a sequence classifier from a model directory laid out the way the
/// Hugging Face hub stores it (`config.json`, `tokenizer.json`, weights).
#[tracing::instrument(
    skip(model_dir, config),
    fields(path = %model_dir.display(), cpu = config.cpu)
)]
pub fn load_classifier(
    model_dir: &Path,
    config: &TransformerConfig,
) -> Result<Arc<dyn Classifier>> {
    if !model_dir.is_dir() {
        bail!("Model path {} is not a directory.", model_dir.display());
    }

    let config_filename = model_dir.join("config.json");
    let raw_config = std::fs::read_to_string(&config_filename)
        .with_context(|| format!("failed to read {}", config_filename.display()))?;
    let manifest: ModelManifest = serde_json::from_str(&raw_config)
        .with_context(|| format!("failed to parse {}", config_filename.display()))?;

    let expected = config.labels.len();
    if let Some(found) = manifest.num_labels() {
        if found != expected {
            bail!("model has {found} output classes, expected {expected}");
        }
    }

    let architecture = Architecture::from_model_type(manifest.model_type.as_deref())?;
    let model_config =
        ArchitectureConfig::parse(architecture, &manifest, &raw_config, &config_filename)?;
    let (weights_filename, weight_format) = resolve_weights(model_dir, config.use_pth)?;
    tracing::info!(
        ?architecture,
        weights = %weights_filename.display(),
        "Loading sequence classification model"
    );

    let device = device(config.cpu)?;
    let tokenizer = load_tokenizer(&model_dir.join("tokenizer.json"), config.max_sequence_length)?;

    let classifier: Arc<dyn Classifier> = match model_config {
        ArchitectureConfig::DebertaV2(model_config) => {
            let vb = var_builder(
                &weights_filename,
                weight_format,
                candle_transformers::models::debertav2::DTYPE,
                &device,
            )?;
            Arc::new(DebertaClassifier::load(
                vb,
                &model_config,
                &config.labels,
                tokenizer,
                device,
            )?)
        }
        ArchitectureConfig::Bert(model_config, hidden_size) => {
            let vb = var_builder(
                &weights_filename,
                weight_format,
                candle_transformers::models::bert::DTYPE,
                &device,
            )?;
            Arc::new(BertClassifier::load(
                vb,
                &model_config,
                hidden_size,
                expected,
                tokenizer,
                device,
            )?)
        }
        ArchitectureConfig::DistilBert(model_config, dim) => {
            let vb = var_builder(
                &weights_filename,
                weight_format,
                candle_transformers::models::distilbert::DTYPE,
                &device,
            )?;
            Arc::new(DistilBertClassifier::load(
                vb,
                &model_config,
                dim,
                expected,
                tokenizer,
                device,
            )?)
        }
    };

    Ok(classifier)
}

fn load_tokenizer(path: &Path, max_sequence_length: usize) -> Result<Tokenizer> {
    let mut tokenizer =
        Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_sequence_length,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;
    Ok(tokenizer)
}

fn var_builder(
    weights_filename: &Path,
    format: WeightFormat,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = match format {
        WeightFormat::Pth => VarBuilder::from_pth(weights_filename, dtype, device)?,
        WeightFormat::Safetensors => unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], dtype, device)?
        },
    };
    Ok(vb)
}

/// Token tensors for one input, each shaped `(1, seq_len)`.
struct EncodedText {
    input_ids: Tensor,
    token_type_ids: Tensor,
    attention_mask: Tensor,
}

fn encode(tokenizer: &Tokenizer, device: &Device, text: &str) -> Result<EncodedText> {
    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

    Ok(EncodedText {
        input_ids: Tensor::new(encoding.get_ids(), device)?.unsqueeze(0)?,
        token_type_ids: Tensor::new(encoding.get_type_ids(), device)?.unsqueeze(0)?,
        attention_mask: Tensor::new(encoding.get_attention_mask(), device)?.unsqueeze(0)?,
    })
}

/// Softmax over `(1, num_classes)` logits.
fn probabilities(logits: &Tensor) -> Result<Vec<f32>> {
    let rows = softmax(&logits.to_dtype(DType::F32)?, 1)?.to_vec2::<f32>()?;
    match <[Vec<f32>; 1]>::try_from(rows) {
        Ok([row]) => Ok(row),
        Err(rows) => bail!("expected a single prediction, got {}", rows.len()),
    }
}

pub struct DebertaClassifier {
    model: DebertaV2SeqClassificationModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl DebertaClassifier {
    fn load(
        vb: VarBuilder,
        model_config: &DebertaV2Config,
        labels: &[String],
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        // The configured label names win over whatever the checkpoint carries.
        let id2label: Id2Label = labels
            .iter()
            .enumerate()
            .map(|(id, label)| (id as u32, label.clone()))
            .collect();

        let vb = vb.set_prefix("deberta");
        let model = DebertaV2SeqClassificationModel::load(vb, model_config, Some(id2label))?;

        Ok(Self {
            model,
            tokenizer,
            device,
        })
    }
}

impl Classifier for DebertaClassifier {
    fn classify(&self, text: &str) -> Result<Vec<f32>> {
        let encoded = encode(&self.tokenizer, &self.device, text)?;
        let logits = self.model.forward(
            &encoded.input_ids,
            Some(encoded.token_type_ids),
            Some(encoded.attention_mask),
        )?;
        probabilities(&logits)
    }
}

/// BERT encoder with the `BertForSequenceClassification` pooler and head.
pub struct BertClassifier {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

impl BertClassifier {
    fn load(
        vb: VarBuilder,
        model_config: &BertConfig,
        hidden_size: usize,
        num_labels: usize,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        let model = BertModel::load(vb.pp("bert"), model_config)?;
        let pooler = candle_nn::linear(hidden_size, hidden_size, vb.pp("bert.pooler.dense"))?;
        let classifier = candle_nn::linear(hidden_size, num_labels, vb.pp("classifier"))?;

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            device,
        })
    }
}

impl Classifier for BertClassifier {
    fn classify(&self, text: &str) -> Result<Vec<f32>> {
        let encoded = encode(&self.tokenizer, &self.device, text)?;
        let hidden = self.model.forward(
            &encoded.input_ids,
            &encoded.token_type_ids,
            Some(&encoded.attention_mask),
        )?;
        // [CLS] token of the only sequence in the batch.
        let cls = hidden.i((.., 0))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        probabilities(&logits)
    }
}

/// DistilBERT encoder with the `DistilBertForSequenceClassification` head.
pub struct DistilBertClassifier {
    model: DistilBertModel,
    pre_classifier: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

impl DistilBertClassifier {
    fn load(
        vb: VarBuilder,
        model_config: &DistilBertConfig,
        dim: usize,
        num_labels: usize,
        tokenizer: Tokenizer,
        device: Device,
    ) -> Result<Self> {
        let model = DistilBertModel::load(vb.pp("distilbert"), model_config)?;
        let pre_classifier = candle_nn::linear(dim, dim, vb.pp("pre_classifier"))?;
        let classifier = candle_nn::linear(dim, num_labels, vb.pp("classifier"))?;

        Ok(Self {
            model,
            pre_classifier,
            classifier,
            tokenizer,
            device,
        })
    }
}

impl Classifier for DistilBertClassifier {
    fn classify(&self, text: &str) -> Result<Vec<f32>> {
        let encoded = encode(&self.tokenizer, &self.device, text)?;
        // Nonzero entries hide a position. A single unpadded sequence hides nothing.
        let seq_len = encoded.input_ids.dim(1)?;
        let mask = Tensor::zeros((seq_len, seq_len), DType::U8, &self.device)?;
        let hidden = self.model.forward(&encoded.input_ids, &mask)?;
        let cls = hidden.i((.., 0))?;
        let pooled = self.pre_classifier.forward(&cls)?.relu()?;
        let logits = self.classifier.forward(&pooled)?;
        probabilities(&logits)
    }
}
