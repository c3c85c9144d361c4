// External imports
use anyhow::{bail, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::{backend::Backend, Tensor};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use log::info;
use polars::prelude::DataFrame;
use rand::seq::SliceRandom;
use std::path::Path;

// Internal imports
use super::step_1_tensor_preparation::build_corpus_sequences;
use super::step_3_model_arch::{HybridModelConfig, HybridRecurrentModel};
use super::step_6_model_serialization::{save_checkpoint, CheckpointMetadata};
use crate::constants;

/// Backend used for the training loop. Swapping in an f16-capable accelerator
/// backend happens here and nowhere else.
pub type TrainingBackend = Autodiff<NdArray<f32>>;
/// Inner backend for forward-only validation and inference.
pub type InferenceBackend = NdArray<f32>;

/// Configuration for training the model
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    pub sequence_length: usize,
    pub validation_split: f64,
    pub lr_patience: usize,
    pub lr_factor: f64,
    pub min_lr: f64,
    pub early_stopping_patience: usize,
    pub min_delta: f64,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
    pub loss_scale: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            batch_size: 32,
            epochs: 100,
            sequence_length: constants::SEQUENCE_LENGTH,
            validation_split: constants::VALIDATION_SPLIT_RATIO,
            lr_patience: 5, // LR scheduler patience, independent of early stopping
            lr_factor: 0.5,
            min_lr: 1e-8,
            early_stopping_patience: 15,
            min_delta: 0.0,
            hidden_size: 128,
            num_layers: 2,
            dropout: 0.2,
            loss_scale: 1024.0,
        }
    }
}

/// Loss multiplier applied before every backward pass.
///
/// This is the reduced-precision compute contract for the training loop:
/// the scaled loss keeps small-magnitude gradients representable, and every
/// batch loss is checked for finiteness before the scale is applied. A
/// non-finite value aborts the run instead of flowing into a checkpoint.
#[derive(Debug, Clone)]
pub struct LossScale {
    scale: f64,
}

impl LossScale {
    pub fn new(scale: f64) -> Self {
        Self {
            scale: if scale > 0.0 { scale } else { 1.0 },
        }
    }

    pub fn apply<B: Backend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        loss * self.scale
    }

    pub fn value(&self) -> f64 {
        self.scale
    }
}

/// Plateau-aware learning-rate scheduler: multiplies the rate by `factor`
/// once validation loss has gone `patience` epochs without improving.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            min_lr,
            best: f64::INFINITY,
            bad_epochs: 0,
        }
    }

    /// Feeds one epoch's validation loss and returns the rate to use next.
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best {
            self.best = val_loss;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
            if self.bad_epochs >= self.patience {
                let reduced = (self.lr * self.factor).max(self.min_lr);
                if reduced < self.lr {
                    info!("Validation loss plateaued; reducing LR to {:.2e}", reduced);
                }
                self.lr = reduced;
                self.bad_epochs = 0;
            }
        }
        self.lr
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }
}

/// One epoch's losses and the learning rate it ran with.
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
}

pub type TrainingHistory = Vec<EpochRecord>;

/// Splits a tensor along the batch dimension into contiguous mini-batches.
fn get_batches<B: Backend, const D: usize>(
    data: &Tensor<B, D>,
    batch_size: usize,
) -> Vec<Tensor<B, D>> {
    let num_samples = data.dims()[0];
    let mut batches = Vec::new();
    let mut start = 0;
    while start < num_samples {
        let end = usize::min(start + batch_size, num_samples);
        batches.push(data.clone().narrow(0, start, end - start));
        start = end;
    }
    batches
}

/// Trains the hybrid model over a multi-symbol corpus of feature frames.
///
/// Fits the corpus scaler, windows every symbol, then runs the epoch loop:
/// shuffled mini-batches forward/backward under the loss-scale contract,
/// forward-only validation on the inner backend, plateau LR decay, and a
/// checkpoint write on every strict validation improvement. Training stops
/// on the epoch budget or once validation has not improved for
/// `early_stopping_patience` epochs. Batch tensors are materialized per
/// epoch and dropped before validation so peak memory stays bounded across
/// a long run. Any non-finite loss aborts with an error; the last good
/// checkpoint on disk stays authoritative.
pub fn train_model(
    frames: &[DataFrame],
    config: &TrainingConfig,
    device: &<TrainingBackend as Backend>::Device,
    checkpoint_base: &Path,
) -> Result<(HybridRecurrentModel<TrainingBackend>, TrainingHistory)> {
    let feature_columns = constants::feature_columns();

    let (scaler, features, targets) = build_corpus_sequences::<TrainingBackend>(
        frames,
        &feature_columns,
        config.sequence_length,
        device,
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let num_samples = features.dims()[0];
    let val_size = ((num_samples as f64) * config.validation_split).round() as usize;
    let train_size = num_samples - val_size;
    if train_size == 0 || val_size == 0 {
        bail!(
            "Corpus of {} sequences cannot be split {}:{} for training and validation",
            num_samples,
            train_size,
            val_size
        );
    }
    info!(
        "Corpus prepared: {} training sequences, {} validation sequences, {} features",
        train_size,
        val_size,
        feature_columns.len()
    );

    let train_features = features.clone().narrow(0, 0, train_size);
    let train_targets = targets.clone().narrow(0, 0, train_size);
    // Validation runs forward-only on the inner backend: no autodiff graph
    let val_features = features.narrow(0, train_size, val_size).inner();
    let val_targets = targets.narrow(0, train_size, val_size).inner();

    let model_config = HybridModelConfig::new(feature_columns.len())
        .with_hidden_size(config.hidden_size)
        .with_num_layers(config.num_layers)
        .with_dropout(config.dropout);
    let metadata = CheckpointMetadata::new(
        &model_config,
        config.sequence_length,
        feature_columns.clone(),
    );

    let mut model: HybridRecurrentModel<TrainingBackend> = model_config.init(device);
    let mut optimizer = AdamConfig::new().init();
    let mut scheduler = PlateauScheduler::new(
        config.learning_rate,
        config.lr_factor,
        config.lr_patience,
        config.min_lr,
    );
    let loss_scale = LossScale::new(config.loss_scale);

    let mut best_model = model.clone();
    let mut best_val_loss = f64::INFINITY;
    let mut epochs_no_improve = 0;
    let mut current_lr = config.learning_rate;
    let mut history: TrainingHistory = Vec::new();
    let mut rng = rand::rng();

    for epoch in 1..=config.epochs {
        let mut batches: Vec<(Tensor<TrainingBackend, 3>, Tensor<TrainingBackend, 2>)> =
            get_batches(&train_features, config.batch_size)
                .into_iter()
                .zip(get_batches(&train_targets, config.batch_size))
                .collect();
        batches.shuffle(&mut rng);
        let num_batches = batches.len();

        let mut epoch_loss = 0.0;
        for (batch_features, batch_targets) in &batches {
            let predictions = model.forward(batch_features.clone());
            let diff = predictions - batch_targets.clone();
            let mse = (diff.clone() * diff).mean();

            let loss_value = mse.clone().into_scalar() as f64;
            if !loss_value.is_finite() {
                bail!(
                    "Non-finite training loss at epoch {}; aborting without checkpointing",
                    epoch
                );
            }
            epoch_loss += loss_value;

            let grads = loss_scale.apply(mse).backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(current_lr, model, grads);
        }
        let train_loss = epoch_loss / num_batches as f64;

        // Batch tensors live only for the epoch
        drop(batches);

        let valid_model = model.valid();
        let val_preds = valid_model.forward(val_features.clone());
        let val_diff = val_preds - val_targets.clone();
        let val_loss = (val_diff.clone() * val_diff).mean().into_scalar() as f64;
        if !val_loss.is_finite() {
            bail!(
                "Non-finite validation loss at epoch {}; aborting without checkpointing",
                epoch
            );
        }

        current_lr = scheduler.step(val_loss);
        history.push(EpochRecord {
            epoch,
            train_loss,
            val_loss,
            learning_rate: current_lr,
        });
        info!(
            "Epoch {}/{}: train loss {:.6}, val loss {:.6}, lr {:.2e}",
            epoch, config.epochs, train_loss, val_loss, current_lr
        );

        if best_val_loss - val_loss > config.min_delta {
            best_val_loss = val_loss;
            best_model = model.clone();
            epochs_no_improve = 0;
            save_checkpoint(&model, &metadata, &scaler, checkpoint_base)?;
            info!("Checkpoint saved (val loss {:.6})", val_loss);
        } else {
            epochs_no_improve += 1;
            if epochs_no_improve >= config.early_stopping_patience {
                info!(
                    "Early stopping at epoch {} (best val loss {:.6})",
                    epoch, best_val_loss
                );
                model = best_model.clone();
                break;
            }
        }
    }

    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FEATURE_COLUMNS;
    use burn_ndarray::NdArrayDevice;
    use polars::prelude::*;
    use tempfile::tempdir;

    fn feature_frame(n: usize, offset: f64) -> DataFrame {
        let mut columns: Vec<Column> = Vec::new();
        for (idx, col) in FEATURE_COLUMNS.iter().enumerate() {
            let values: Vec<f64> = (0..n)
                .map(|i| (i as f64 * 0.07 + idx as f64 + offset).sin())
                .collect();
            columns.push(Series::new((*col).into(), values).into_column());
        }
        let close: Vec<f64> = (0..n)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 2.0 + offset)
            .collect();
        columns.push(Series::new("close".into(), close).into_column());
        DataFrame::new(columns).unwrap()
    }

    #[test]
    fn test_plateau_scheduler_halves_after_patience() {
        let mut scheduler = PlateauScheduler::new(0.1, 0.5, 2, 1e-8);

        assert_eq!(scheduler.step(1.0), 0.1); // improvement
        assert_eq!(scheduler.step(1.0), 0.1); // bad epoch 1
        assert_eq!(scheduler.step(1.0), 0.05); // bad epoch 2 -> halve
        assert_eq!(scheduler.step(0.5), 0.05); // improvement keeps the new rate
    }

    #[test]
    fn test_plateau_scheduler_floors_at_min_lr() {
        let mut scheduler = PlateauScheduler::new(1e-8, 0.5, 1, 1e-8);
        assert_eq!(scheduler.step(1.0), 1e-8);
        assert_eq!(scheduler.step(1.0), 1e-8);
        assert_eq!(scheduler.learning_rate(), 1e-8);
    }

    #[test]
    fn test_loss_scale_multiplies_loss() {
        let device = NdArrayDevice::default();
        let scale = LossScale::new(8.0);
        let loss = Tensor::<NdArray<f32>, 1>::from_floats([0.5], &device);
        let scaled = scale.apply(loss).into_scalar();
        assert!((scaled - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_loss_scale_rejects_non_positive() {
        assert_eq!(LossScale::new(0.0).value(), 1.0);
        assert_eq!(LossScale::new(-4.0).value(), 1.0);
    }

    #[test]
    fn test_get_batches_covers_all_samples() {
        let device = NdArrayDevice::default();
        let data = Tensor::<NdArray<f32>, 2>::ones([10, 3], &device);
        let batches = get_batches(&data, 4);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].dims(), [4, 3]);
        assert_eq!(batches[2].dims(), [2, 3]);
    }

    #[test]
    fn test_train_model_writes_checkpoint_and_history() -> Result<()> {
        let temp_dir = tempdir()?;
        let base = temp_dir.path().join("returns_model");
        let device = <TrainingBackend as Backend>::Device::default();

        let frames = vec![feature_frame(30, 0.0), feature_frame(28, 1.0)];
        let config = TrainingConfig {
            epochs: 2,
            batch_size: 8,
            sequence_length: 12,
            validation_split: 0.2,
            hidden_size: 8,
            num_layers: 1,
            ..Default::default()
        };

        let (_, history) = train_model(&frames, &config, &device, &base)?;

        assert!(!history.is_empty());
        assert!(history.len() <= config.epochs);
        for record in &history {
            assert!(record.train_loss.is_finite());
            assert!(record.val_loss.is_finite());
        }
        assert!(base.with_extension("bin").exists());
        assert!(base.with_extension("meta.json").exists());
        assert!(base.with_extension("scaler.json").exists());

        temp_dir.close()?;
        Ok(())
    }
}
