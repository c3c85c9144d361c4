use anyhow::{Context, Result};
use burn::prelude::Backend;
use std::path::{Path, PathBuf};

use crate::hybrid::step_1_tensor_preparation::FeatureScaler;
use crate::hybrid::step_3_model_arch::HybridRecurrentModel;
use crate::hybrid::step_6_model_serialization::{
    load_checkpoint, save_checkpoint, verify_checkpoint, CheckpointMetadata,
};
use crate::constants::CHECKPOINT_FILE_STEM;

/// Base path (without extension) of the checkpoint artifacts inside a
/// checkpoint directory.
pub fn checkpoint_base(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join(CHECKPOINT_FILE_STEM)
}

/// Save a trained model, its metadata, and the corpus scaler into the
/// checkpoint directory.
pub fn save_trained_model<B: Backend>(
    model: &HybridRecurrentModel<B>,
    metadata: &CheckpointMetadata,
    scaler: &FeatureScaler,
    checkpoint_dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(checkpoint_dir).context("Failed to create checkpoint directory")?;

    let base = checkpoint_base(checkpoint_dir);
    save_checkpoint(model, metadata, scaler, &base).context("Failed to save model")?;

    log::info!("Model saved to: {}", base.display());
    Ok(base)
}

/// Load the trained model, metadata, and scaler from a checkpoint directory.
pub fn load_trained_model<B: Backend>(
    checkpoint_dir: &Path,
    device: &B::Device,
) -> Result<(HybridRecurrentModel<B>, CheckpointMetadata, FeatureScaler)> {
    let base = checkpoint_base(checkpoint_dir);
    log::info!("Loading model from: {}", base.display());
    load_checkpoint(&base, device).context("Failed to load model")
}

/// True when a complete, parseable checkpoint exists in the directory.
pub fn has_trained_model(checkpoint_dir: &Path) -> Result<bool> {
    verify_checkpoint(checkpoint_base(checkpoint_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::step_3_model_arch::HybridModelConfig;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use polars::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load_from_directory() -> Result<()> {
        let temp_dir = tempdir()?;
        let device = NdArrayDevice::Cpu;

        let columns = vec!["x".to_string(), "y".to_string()];
        let config = HybridModelConfig::new(columns.len()).with_hidden_size(8);
        let model: HybridRecurrentModel<NdArray> = config.init(&device);
        let metadata = CheckpointMetadata::new(&config, 20, columns.clone());

        let values: Vec<f64> = (0..30).map(|i| i as f64 * 0.5).collect();
        let df = DataFrame::new(vec![
            Series::new("x".into(), values.clone()).into_column(),
            Series::new("y".into(), values).into_column(),
        ])?;
        let scaler = FeatureScaler::fit(&df, &columns)?;

        assert!(!has_trained_model(temp_dir.path())?);
        save_trained_model(&model, &metadata, &scaler, temp_dir.path())?;
        assert!(has_trained_model(temp_dir.path())?);

        let (_, loaded_metadata, loaded_scaler) =
            load_trained_model::<NdArray>(temp_dir.path(), &device)?;
        assert_eq!(loaded_metadata.input_size, columns.len());
        assert_eq!(loaded_scaler, scaler);

        temp_dir.close()?;
        Ok(())
    }
}
