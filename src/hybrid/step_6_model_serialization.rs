use anyhow::{bail, Context, Result};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

use super::step_1_tensor_preparation::FeatureScaler;
use super::step_3_model_arch::{HybridModelConfig, HybridRecurrentModel};

/// Everything needed to rebuild the model shape before loading weights, plus
/// the feature-column ordering the scaler and weights were trained against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointMetadata {
    pub version: String,
    pub timestamp: u64,
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
    pub sequence_length: usize,
    pub feature_columns: Vec<String>,
}

impl CheckpointMetadata {
    pub fn new(
        config: &HybridModelConfig,
        sequence_length: usize,
        feature_columns: Vec<String>,
    ) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            input_size: config.input_size,
            hidden_size: config.hidden_size,
            num_layers: config.num_layers,
            dropout: config.dropout,
            sequence_length,
            feature_columns,
        }
    }

    pub fn model_config(&self) -> HybridModelConfig {
        HybridModelConfig {
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            dropout: self.dropout,
        }
    }
}

fn weights_path(base: &Path) -> std::path::PathBuf {
    base.with_extension("bin")
}

fn metadata_path(base: &Path) -> std::path::PathBuf {
    base.with_extension("meta.json")
}

fn scaler_path(base: &Path) -> std::path::PathBuf {
    base.with_extension("scaler.json")
}

/// Persists the three checkpoint artifacts: weights, metadata, scaler.
///
/// A new best checkpoint overwrites the previous files whole; nothing is
/// mutated in place.
pub fn save_checkpoint<B: Backend>(
    model: &HybridRecurrentModel<B>,
    metadata: &CheckpointMetadata,
    scaler: &FeatureScaler,
    base: impl AsRef<Path>,
) -> Result<()> {
    let base = base.as_ref();
    if let Some(parent) = base.parent() {
        std::fs::create_dir_all(parent).context("Failed to create checkpoint directory")?;
    }

    model
        .clone()
        .save_file::<BinFileRecorder<FullPrecisionSettings>, _>(
            weights_path(base),
            &Default::default(),
        )
        .context("Failed to save model weights")?;

    let metadata_json =
        serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
    std::fs::write(metadata_path(base), metadata_json)
        .context("Failed to write metadata file")?;

    let scaler_json = serde_json::to_string_pretty(scaler).context("Failed to serialize scaler")?;
    std::fs::write(scaler_path(base), scaler_json).context("Failed to write scaler file")?;

    Ok(())
}

/// Loads a checkpoint: metadata first to rebuild the model shape, then the
/// weights, then the scaler. The scaler's column ordering must match the
/// metadata's feature-column list exactly.
pub fn load_checkpoint<B: Backend>(
    base: impl AsRef<Path>,
    device: &B::Device,
) -> Result<(HybridRecurrentModel<B>, CheckpointMetadata, FeatureScaler)> {
    let base = base.as_ref();

    let metadata_json = std::fs::read_to_string(metadata_path(base))
        .context("Failed to read checkpoint metadata")?;
    let metadata: CheckpointMetadata =
        serde_json::from_str(&metadata_json).context("Failed to parse checkpoint metadata")?;

    let skeleton = metadata.model_config().init::<B>(device);
    let model = skeleton
        .load_file::<BinFileRecorder<FullPrecisionSettings>, _>(
            weights_path(base),
            &Default::default(),
            device,
        )
        .context("Failed to load model weights")?;

    let scaler_json =
        std::fs::read_to_string(scaler_path(base)).context("Failed to read scaler file")?;
    let scaler: FeatureScaler =
        serde_json::from_str(&scaler_json).context("Failed to parse scaler file")?;

    if scaler.columns() != metadata.feature_columns.as_slice() {
        bail!(
            "Scaler column ordering does not match checkpoint feature columns ({} vs {})",
            scaler.columns().len(),
            metadata.feature_columns.len()
        );
    }

    Ok((model, metadata, scaler))
}

/// Checks that a checkpoint exists and its metadata parses.
pub fn verify_checkpoint(base: impl AsRef<Path>) -> Result<bool> {
    let base = base.as_ref();
    if !weights_path(base).exists()
        || !metadata_path(base).exists()
        || !scaler_path(base).exists()
    {
        return Ok(false);
    }

    let metadata_json = std::fs::read_to_string(metadata_path(base))
        .context("Failed to read checkpoint metadata")?;
    let _: CheckpointMetadata =
        serde_json::from_str(&metadata_json).context("Failed to parse checkpoint metadata")?;

    Ok(true)
}
