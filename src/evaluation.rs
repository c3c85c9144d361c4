//! Held-out evaluation metrics for predicted vs. realized returns.

use anyhow::{bail, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::hybrid::step_3_model_arch::HybridRecurrentModel;

/// Root mean squared error.
pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mse = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum::<f64>()
        / actual.len() as f64;
    mse.sqrt()
}

/// Mean absolute error.
pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p).abs())
        .sum::<f64>()
        / actual.len() as f64
}

/// Coefficient of determination. A constant actual series scores 0.
pub fn r2(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let mean = actual.iter().sum::<f64>() / actual.len() as f64;
    let ss_tot: f64 = actual.iter().map(|a| (a - mean) * (a - mean)).sum();
    if ss_tot == 0.0 {
        return 0.0;
    }
    let ss_res: f64 = actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    1.0 - ss_res / ss_tot
}

/// Mean absolute percentage error, with a small guard against zero actuals.
pub fn mape(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    actual
        .iter()
        .zip(predicted.iter())
        .map(|(a, p)| ((a - p) / (a + 1e-10)).abs())
        .sum::<f64>()
        / actual.len() as f64
        * 100.0
}

/// Share of steps where predicted and realized returns agree in sign, as a
/// percentage in [0, 100].
pub fn directional_accuracy(actual: &[f64], predicted: &[f64]) -> f64 {
    if actual.is_empty() {
        return 0.0;
    }
    let agreeing = actual
        .iter()
        .zip(predicted.iter())
        .filter(|(a, p)| a.signum() == p.signum())
        .count();
    agreeing as f64 / actual.len() as f64 * 100.0
}

/// Compounds a return sequence into a price path: p_k = p0 * prod(1 + r_i).
pub fn reconstruct_prices(initial_price: f64, returns: &[f64]) -> Vec<f64> {
    let mut prices = Vec::with_capacity(returns.len());
    let mut price = initial_price;
    for r in returns {
        price *= 1.0 + r;
        prices.push(price);
    }
    prices
}

/// Aggregate evaluation metrics over a held-out set.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionReport {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub mape: f64,
    pub directional_accuracy: f64,
}

impl RegressionReport {
    pub fn compute(actual: &[f64], predicted: &[f64]) -> Self {
        Self {
            rmse: rmse(actual, predicted),
            mae: mae(actual, predicted),
            r2: r2(actual, predicted),
            mape: mape(actual, predicted),
            directional_accuracy: directional_accuracy(actual, predicted),
        }
    }
}

/// Runs the model over held-out sequence tensors and reports return metrics.
pub fn evaluate_model<B: Backend>(
    model: &HybridRecurrentModel<B>,
    features: Tensor<B, 3>,
    targets: Tensor<B, 2>,
) -> Result<RegressionReport> {
    if features.dims()[0] == 0 {
        bail!("Cannot evaluate on an empty sequence set");
    }

    let predictions = model.forward(features);

    let pred_data = predictions.to_data().convert::<f32>();
    let pred_slice = pred_data
        .as_slice::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read predictions: {:?}", e))?;
    let target_data = targets.to_data().convert::<f32>();
    let target_slice = target_data
        .as_slice::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read targets: {:?}", e))?;

    let predicted: Vec<f64> = pred_slice.iter().map(|&v| v as f64).collect();
    let actual: Vec<f64> = target_slice.iter().map(|&v| v as f64).collect();

    Ok(RegressionReport::compute(&actual, &predicted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::step_3_model_arch::HybridModelConfig;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn test_price_reconstruction_round_trip() {
        let prices = reconstruct_prices(100.0, &[0.01, -0.02, 0.005]);
        assert_eq!(prices.len(), 3);
        assert!((prices[0] - 101.0).abs() < 1e-9);
        assert!((prices[1] - 98.98).abs() < 1e-9);
        assert!((prices[2] - 99.4749).abs() < 1e-9);
    }

    #[test]
    fn test_perfect_prediction_metrics() {
        let actual = vec![0.01, -0.02, 0.005, 0.0, 0.03];
        let report = RegressionReport::compute(&actual, &actual);

        assert!(report.rmse.abs() < 1e-12);
        assert!(report.mae.abs() < 1e-12);
        assert!((report.r2 - 1.0).abs() < 1e-12);
        assert_eq!(report.directional_accuracy, 100.0);
    }

    #[test]
    fn test_metric_ranges_on_noisy_predictions() {
        let actual: Vec<f64> = (0..50).map(|i| ((i as f64) * 0.7).sin() * 0.02).collect();
        let predicted: Vec<f64> = actual.iter().map(|a| a * 0.5 + 0.001).collect();
        let report = RegressionReport::compute(&actual, &predicted);

        assert!(report.rmse >= 0.0 && report.rmse.is_finite());
        assert!(report.mae >= 0.0 && report.mae.is_finite());
        assert!(report.r2 <= 1.0 && report.r2.is_finite());
        assert!(report.mape >= 0.0 && report.mape.is_finite());
        assert!((0.0..=100.0).contains(&report.directional_accuracy));
    }

    #[test]
    fn test_directional_accuracy_counts_sign_agreement() {
        let actual = vec![0.01, -0.01, 0.02, -0.02];
        let predicted = vec![0.02, 0.01, 0.01, -0.05];
        // Signs agree on indices 0, 2, 3
        assert_eq!(directional_accuracy(&actual, &predicted), 75.0);
    }

    #[test]
    fn test_r2_constant_actuals() {
        let actual = vec![0.5; 10];
        let predicted = vec![0.25; 10];
        assert_eq!(r2(&actual, &predicted), 0.0);
    }

    #[test]
    fn test_empty_slices() {
        assert_eq!(rmse(&[], &[]), 0.0);
        assert_eq!(mae(&[], &[]), 0.0);
        assert_eq!(directional_accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn test_evaluate_model_produces_finite_report() {
        let device = NdArrayDevice::default();
        let model: crate::hybrid::step_3_model_arch::HybridRecurrentModel<NdArray> =
            HybridModelConfig::new(4)
                .with_hidden_size(8)
                .with_num_layers(1)
                .init(&device);

        let features = Tensor::<NdArray, 3>::ones([6, 10, 4], &device);
        let targets = Tensor::<NdArray, 2>::ones([6, 1], &device) * 0.01;

        let report = evaluate_model(&model, features, targets).unwrap();
        assert!(report.rmse.is_finite());
        assert!(report.mae.is_finite());
        assert!(report.r2.is_finite() || report.r2 == 0.0);
    }

    #[test]
    fn test_evaluate_model_rejects_empty_set() {
        let device = NdArrayDevice::default();
        let model: crate::hybrid::step_3_model_arch::HybridRecurrentModel<NdArray> =
            HybridModelConfig::new(4)
                .with_hidden_size(8)
                .with_num_layers(1)
                .init(&device);

        let features = Tensor::<NdArray, 3>::empty([0, 10, 4], &device);
        let targets = Tensor::<NdArray, 2>::empty([0, 1], &device);
        assert!(evaluate_model(&model, features, targets).is_err());
    }
}
