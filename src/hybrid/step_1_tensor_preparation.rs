// External crates
use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor};
use ndarray::Array2;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Per-column z-score normalization parameters.
///
/// The scaler is fitted exactly once, over the full training corpus, and
/// persisted next to the model weights; inference reuses the persisted
/// statistics and never refits. The column ordering is part of the contract:
/// `transform` applies the statistics in the order they were fitted, and the
/// checkpoint loader rejects a scaler whose ordering disagrees with the
/// recorded feature-column list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    columns: Vec<String>,
    means: Vec<f64>,
    stds: Vec<f64>,
}

impl FeatureScaler {
    /// Fits mean/std for each of the given columns.
    pub fn fit(df: &DataFrame, columns: &[String]) -> PolarsResult<Self> {
        let mut means = Vec::with_capacity(columns.len());
        let mut stds = Vec::with_capacity(columns.len());

        for col in columns {
            let series = df.column(col)?.as_materialized_series().clone();
            let series = if series.dtype() == &DataType::Int64 {
                series.cast(&DataType::Float64)?
            } else {
                series
            };

            let (mean, std) = match (series.mean(), series.std(1)) {
                (Some(mean), Some(std)) => (mean, std),
                _ => {
                    return Err(PolarsError::ComputeError(
                        format!("Cannot compute statistics for column '{}'", col).into(),
                    ))
                }
            };

            means.push(mean);
            // Constant columns scale to zero instead of dividing by zero
            stds.push(if std.abs() < f64::EPSILON { 0.0 } else { std });
        }

        Ok(Self {
            columns: columns.to_vec(),
            means,
            stds,
        })
    }

    /// Applies the fitted statistics in place, column by column in the fitted
    /// order.
    pub fn transform(&self, df: &mut DataFrame) -> PolarsResult<()> {
        for (i, col) in self.columns.iter().enumerate() {
            let series = df.column(col)?.as_materialized_series().clone();
            let series = if series.dtype() == &DataType::Int64 {
                series.cast(&DataType::Float64)?
            } else {
                series
            };

            if self.stds[i] == 0.0 {
                let constant =
                    Series::new(PlSmallStr::from(col.as_str()), vec![0.0f64; df.height()]);
                df.replace(col, constant)?;
                continue;
            }

            let normalized = (series - self.means[i]) / self.stds[i];
            df.replace(col, normalized)?;
        }
        Ok(())
    }

    /// Scales a single value for the named column. Returns `None` when the
    /// column was not part of the fit.
    pub fn transform_value(&self, column: &str, value: f64) -> Option<f64> {
        let idx = self.columns.iter().position(|c| c == column)?;
        if self.stds[idx] == 0.0 {
            Some(0.0)
        } else {
            Some((value - self.means[idx]) / self.stds[idx])
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Splits the DataFrame chronologically into training and validation sets
pub fn split_train_val(df: &DataFrame, validation_split: f64) -> PolarsResult<(DataFrame, DataFrame)> {
    if df.height() == 0 {
        return Err(PolarsError::ComputeError("Empty DataFrame".into()));
    }
    if !(0.0..=1.0).contains(&validation_split) {
        return Err(PolarsError::ComputeError(
            "Validation split must be between 0.0 and 1.0".into(),
        ));
    }

    let n_samples = df.height();
    let split_idx = (n_samples as f64 * (1.0 - validation_split)) as usize;

    let train_df = df.slice(0, split_idx);
    let val_df = df.slice(split_idx as i64, n_samples - split_idx);

    Ok((train_df, val_df))
}

/// Number of sequences an M-row feature series yields for window length L.
pub fn sequence_count(rows: usize, sequence_length: usize) -> usize {
    rows.saturating_sub(sequence_length)
}

/// Converts a scaled feature DataFrame into model tensors.
///
/// Sequence i covers rows [i, i + L); its target is the simple return
/// realized between the closes at rows i + L - 1 and i + L. The `close`
/// column stays unscaled; it is only read for targets and is not a model
/// feature.
pub fn build_sequences<B: Backend>(
    df: &DataFrame,
    feature_columns: &[String],
    sequence_length: usize,
    device: &B::Device,
) -> PolarsResult<(Tensor<B, 3>, Tensor<B, 2>)> {
    let n_samples = df.height();
    let n_sequences = sequence_count(n_samples, sequence_length);
    if n_sequences == 0 {
        return Err(PolarsError::ComputeError(
            format!(
                "Not enough rows ({}) for sequence length ({})",
                n_samples, sequence_length
            )
            .into(),
        ));
    }

    let n_features = feature_columns.len();
    let columns: Vec<Series> = feature_columns
        .iter()
        .map(|name| {
            df.column(name)
                .map(|c| c.as_materialized_series().clone())
        })
        .collect::<PolarsResult<_>>()?;

    let close_ca = df.column("close")?.f64()?.clone();
    let close: Vec<f64> = (0..close_ca.len())
        .map(|i| close_ca.get(i).unwrap_or(f64::NAN))
        .collect();

    let mut features_data = vec![0f32; n_sequences * sequence_length * n_features];
    let mut target_data = vec![0f32; n_sequences];

    // Parallel fill: each chunk is one sequence
    features_data
        .par_chunks_mut(sequence_length * n_features)
        .enumerate()
        .for_each(|(i, chunk)| {
            for j in 0..sequence_length {
                for k in 0..n_features {
                    let val = columns[k].f64().unwrap().get(i + j).unwrap_or(0.0) as f32;
                    chunk[j * n_features + k] = val;
                }
            }
        });

    target_data
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, target)| {
            let prev = close[i + sequence_length - 1];
            let next = close[i + sequence_length];
            *target = ((next - prev) / prev) as f32;
        });

    let features_shape = Shape::new([n_sequences, sequence_length, n_features]);
    let target_shape = Shape::new([n_sequences, 1]);

    let features_tensor: Tensor<B, 3> =
        Tensor::<B, 1>::from_floats(features_data.as_slice(), device).reshape(features_shape);
    let target_tensor: Tensor<B, 2> =
        Tensor::<B, 1>::from_floats(target_data.as_slice(), device).reshape(target_shape);

    Ok((features_tensor, target_tensor))
}

/// Extracts the scaled most-recent window as a dense buffer for the forecast
/// engine.
pub fn last_window(
    df: &DataFrame,
    feature_columns: &[String],
    sequence_length: usize,
) -> PolarsResult<Array2<f32>> {
    let n_samples = df.height();
    if n_samples < sequence_length {
        return Err(PolarsError::ComputeError(
            format!(
                "Need at least {} rows for an inference window, found {}",
                sequence_length, n_samples
            )
            .into(),
        ));
    }

    let n_features = feature_columns.len();
    let start = n_samples - sequence_length;
    let columns: Vec<Series> = feature_columns
        .iter()
        .map(|name| {
            df.column(name)
                .map(|c| c.as_materialized_series().clone())
        })
        .collect::<PolarsResult<_>>()?;

    let mut window = Array2::<f32>::zeros((sequence_length, n_features));
    for j in 0..sequence_length {
        for k in 0..n_features {
            window[[j, k]] = columns[k].f64()?.get(start + j).unwrap_or(0.0) as f32;
        }
    }

    Ok(window)
}

/// Fits one scaler over a multi-symbol corpus, then windows each symbol
/// independently so sequences never cross symbol boundaries.
pub fn build_corpus_sequences<B: Backend>(
    frames: &[DataFrame],
    feature_columns: &[String],
    sequence_length: usize,
    device: &B::Device,
) -> PolarsResult<(FeatureScaler, Tensor<B, 3>, Tensor<B, 2>)> {
    if frames.is_empty() {
        return Err(PolarsError::ComputeError("No feature frames supplied".into()));
    }

    let mut corpus = frames[0].select(feature_columns)?;
    for frame in &frames[1..] {
        corpus.vstack_mut(&frame.select(feature_columns)?)?;
    }
    let scaler = FeatureScaler::fit(&corpus, feature_columns)?;

    let mut feature_tensors = Vec::with_capacity(frames.len());
    let mut target_tensors = Vec::with_capacity(frames.len());
    for frame in frames {
        if sequence_count(frame.height(), sequence_length) == 0 {
            log::warn!(
                "Skipping frame with {} rows: too short for sequence length {}",
                frame.height(),
                sequence_length
            );
            continue;
        }
        let mut scaled = frame.clone();
        scaler.transform(&mut scaled)?;
        let (features, targets) =
            build_sequences::<B>(&scaled, feature_columns, sequence_length, device)?;
        feature_tensors.push(features);
        target_tensors.push(targets);
    }

    if feature_tensors.is_empty() {
        return Err(PolarsError::ComputeError(
            "No frame was long enough to produce sequences".into(),
        ));
    }

    Ok((
        scaler,
        Tensor::cat(feature_tensors, 0),
        Tensor::cat(target_tensors, 0),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FEATURE_COLUMNS;
    use burn_ndarray::{NdArray, NdArrayDevice};

    fn feature_frame(n: usize) -> DataFrame {
        let mut columns: Vec<Column> = Vec::new();
        for (idx, col) in FEATURE_COLUMNS.iter().enumerate() {
            let values: Vec<f64> = (0..n).map(|i| i as f64 * 0.01 + idx as f64).collect();
            columns.push(Series::new((*col).into(), values).into_column());
        }
        let close: Vec<f64> = (0..n).map(|i| 100.0 + i as f64).collect();
        columns.push(Series::new("close".into(), close).into_column());
        DataFrame::new(columns).unwrap()
    }

    #[test]
    fn test_sequence_count_property() {
        assert_eq!(sequence_count(100, 60), 40);
        assert_eq!(sequence_count(60, 60), 0);
        assert_eq!(sequence_count(10, 60), 0);
    }

    #[test]
    fn test_build_sequences_shapes_and_targets() {
        let device = NdArrayDevice::default();
        let n = 70;
        let seq_len = 60;
        let df = feature_frame(n);
        let cols = crate::constants::feature_columns();

        let (features, targets) =
            build_sequences::<NdArray>(&df, &cols, seq_len, &device).unwrap();
        assert_eq!(features.dims(), [10, seq_len, FEATURE_COLUMNS.len()]);
        assert_eq!(targets.dims(), [10, 1]);

        let data = targets.to_data().convert::<f32>();
        let slice = data.as_slice::<f32>().unwrap();
        for (i, &target) in slice.iter().enumerate() {
            let prev = 100.0 + (i + seq_len - 1) as f64;
            let next = 100.0 + (i + seq_len) as f64;
            let expected = ((next - prev) / prev) as f32;
            assert!((target - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_build_sequences_rejects_short_frame() {
        let device = NdArrayDevice::default();
        let df = feature_frame(30);
        let cols = crate::constants::feature_columns();
        let result = build_sequences::<NdArray>(&df, &cols, 60, &device);
        assert!(result.is_err());
    }

    #[test]
    fn test_scaler_normalizes_to_zero_mean_unit_std() {
        let df = feature_frame(200);
        let cols = crate::constants::feature_columns();
        let scaler = FeatureScaler::fit(&df, &cols).unwrap();

        let mut scaled = df.clone();
        scaler.transform(&mut scaled).unwrap();

        for col in &cols {
            let series = scaled.column(col).unwrap().as_materialized_series().clone();
            let mean = series.mean().unwrap();
            let std = series.std(1).unwrap();
            assert!(mean.abs() < 1e-9, "column {} mean {}", col, mean);
            assert!((std - 1.0).abs() < 1e-9, "column {} std {}", col, std);
        }
    }

    #[test]
    fn test_scaler_policy_consistency() {
        // The persisted scaler must reproduce training-time normalization on
        // new single values: transform_value agrees with transform.
        let df = feature_frame(150);
        let cols = crate::constants::feature_columns();
        let scaler = FeatureScaler::fit(&df, &cols).unwrap();

        let mut scaled = df.clone();
        scaler.transform(&mut scaled).unwrap();

        let raw = df.column("returns").unwrap().f64().unwrap().get(42).unwrap();
        let expected = scaled.column("returns").unwrap().f64().unwrap().get(42).unwrap();
        let via_value = scaler.transform_value("returns", raw).unwrap();
        assert!((via_value - expected).abs() < 1e-12);

        assert!(scaler.transform_value("no_such_column", 1.0).is_none());
    }

    #[test]
    fn test_scaler_constant_column_maps_to_zero() {
        let constant = vec![5.0f64; 50];
        let df = DataFrame::new(vec![
            Series::new("flat".into(), constant).into_column(),
        ])
        .unwrap();
        let cols = vec!["flat".to_string()];
        let scaler = FeatureScaler::fit(&df, &cols).unwrap();

        let mut scaled = df.clone();
        scaler.transform(&mut scaled).unwrap();
        let ca = scaled.column("flat").unwrap().f64().unwrap().clone();
        for i in 0..ca.len() {
            assert_eq!(ca.get(i), Some(0.0));
        }
        assert_eq!(scaler.transform_value("flat", 123.0), Some(0.0));
    }

    #[test]
    fn test_split_train_val_ratio() {
        let df = feature_frame(100);
        let (train, val) = split_train_val(&df, 0.2).unwrap();
        assert_eq!(train.height(), 80);
        assert_eq!(val.height(), 20);
    }

    #[test]
    fn test_last_window_shape_and_content() {
        let df = feature_frame(80);
        let cols = crate::constants::feature_columns();
        let window = last_window(&df, &cols, 60).unwrap();
        assert_eq!(window.dim(), (60, FEATURE_COLUMNS.len()));

        // Last row of the window equals the last frame row
        let last = df.column("returns").unwrap().f64().unwrap().get(79).unwrap() as f32;
        assert!((window[[59, 0]] - last).abs() < 1e-6);
    }

    #[test]
    fn test_corpus_sequences_do_not_cross_symbol_boundaries() {
        let device = NdArrayDevice::default();
        let cols = crate::constants::feature_columns();
        let a = feature_frame(70);
        let b = feature_frame(65);

        let (_, features, targets) =
            build_corpus_sequences::<NdArray>(&[a, b], &cols, 60, &device).unwrap();
        // 10 sequences from the first frame, 5 from the second; a single
        // 135-row frame would have produced 75.
        assert_eq!(features.dims()[0], 15);
        assert_eq!(targets.dims()[0], 15);
    }
}
