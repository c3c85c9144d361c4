// External imports
use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use log::{debug, error};
use ndarray::{s, Array1, Array2};
use polars::prelude::*;
use serde::Serialize;

// Internal imports
use super::step_1_tensor_preparation::{last_window, FeatureScaler};
use super::step_3_model_arch::HybridRecurrentModel;
use crate::constants::{FEEDBACK_COLUMN, MAX_FORECAST_HORIZON, MIN_FORECAST_HORIZON};
use crate::error::ForecastError;

/// One forecast day: the trading date, the reconstructed price (2 decimals),
/// and the predicted return as a percentage (2 decimals).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastStep {
    pub date: NaiveDate,
    pub predicted_price: f64,
    pub predicted_return: f64,
}

/// Advances to the next trading day, one calendar day at a time, skipping
/// Saturdays and Sundays.
pub fn next_trading_day(date: NaiveDate) -> NaiveDate {
    let mut next = date + Duration::days(1);
    while matches!(next.weekday(), Weekday::Sat | Weekday::Sun) {
        next += Duration::days(1);
    }
    next
}

/// Rounds to two decimal places at the emission boundary.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn validate_horizon(horizon: usize) -> Result<(), ForecastError> {
    if !(MIN_FORECAST_HORIZON..=MAX_FORECAST_HORIZON).contains(&horizon) {
        return Err(ForecastError::HorizonOutOfRange {
            requested: horizon,
            min: MIN_FORECAST_HORIZON,
            max: MAX_FORECAST_HORIZON,
        });
    }
    Ok(())
}

/// Produces an N-day autoregressive forecast from a feature series.
///
/// `feature_df` is the unscaled output of the feature pipeline, ending on the
/// last observed trading date. The engine scales it with the persisted
/// corpus scaler, takes the most recent L-row window, and iterates: model
/// forward, price compounding, weekend-skipping date advance, and the window
/// update. Extrapolation policy: the appended feature row is the previous
/// window's final row carried forward unchanged, except the designated
/// feedback slot, which is overwritten with the scaler-transformed cumulative
/// price change relative to the last truly observed close. Every other
/// indicator therefore goes stale as the horizon grows, and forecast quality
/// is expected to degrade with N.
///
/// Returns `Ok(None)` when fewer than L + 1 usable feature rows exist. Any
/// non-finite value aborts the whole forecast; partial forecasts are never
/// returned.
pub fn generate_forecast<B: Backend>(
    model: &HybridRecurrentModel<B>,
    scaler: &FeatureScaler,
    feature_columns: &[String],
    feature_df: &DataFrame,
    symbol: &str,
    sequence_length: usize,
    horizon: usize,
    device: &B::Device,
) -> Result<Option<Vec<ForecastStep>>, ForecastError> {
    validate_horizon(horizon)?;

    if feature_df.height() < sequence_length + 1 {
        debug!(
            "{}: {} usable feature rows, need {} for a forecast",
            symbol,
            feature_df.height(),
            sequence_length + 1
        );
        return Ok(None);
    }

    let last_close = {
        let close = feature_df.column("close")?.f64()?.clone();
        close
            .get(close.len() - 1)
            .ok_or_else(|| ForecastError::MissingColumn("close".to_string()))?
    };
    let last_date = {
        let dates = feature_df.column("trade_date")?.str()?.clone();
        let raw = dates
            .get(dates.len() - 1)
            .ok_or_else(|| ForecastError::MissingColumn("trade_date".to_string()))?
            .to_string();
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|_| ForecastError::InvalidDate(raw))?
    };

    let feedback_idx = feature_columns
        .iter()
        .position(|c| c == FEEDBACK_COLUMN)
        .ok_or_else(|| ForecastError::MissingColumn(FEEDBACK_COLUMN.to_string()))?;

    let mut scaled = feature_df.clone();
    scaler.transform(&mut scaled)?;
    let mut window: Array2<f32> = last_window(&scaled, feature_columns, sequence_length)?;

    let n_features = feature_columns.len();
    let mut steps = Vec::with_capacity(horizon);
    let mut price = last_close;
    let mut date = last_date;

    for _ in 0..horizon {
        let buffer: Vec<f32> = window.iter().copied().collect();
        let input: Tensor<B, 3> = Tensor::<B, 1>::from_floats(buffer.as_slice(), device)
            .reshape(Shape::new([1, sequence_length, n_features]));

        let output = model.forward(input);
        let data = output.to_data().convert::<f32>();
        let predicted = data.as_slice::<f32>().map(|s| s[0]).map_err(|_| {
            ForecastError::Numerical {
                symbol: symbol.to_string(),
                stage: "model output extraction",
            }
        })?;
        if !predicted.is_finite() {
            error!("{}: model produced a non-finite return", symbol);
            return Err(ForecastError::Numerical {
                symbol: symbol.to_string(),
                stage: "model forward",
            });
        }

        let predicted_return = predicted as f64;
        price *= 1.0 + predicted_return;
        if !price.is_finite() {
            error!("{}: price reconstruction overflowed", symbol);
            return Err(ForecastError::Numerical {
                symbol: symbol.to_string(),
                stage: "price reconstruction",
            });
        }
        date = next_trading_day(date);

        steps.push(ForecastStep {
            date,
            predicted_price: round2(price),
            predicted_return: round2(predicted_return * 100.0),
        });

        // Approximate the unobserved next feature row: carry the last row
        // forward and rewrite the feedback slot with the cumulative change
        // against the last observed close, in scaler space.
        let cumulative_change = (price - last_close) / last_close;
        let scaled_feedback = scaler
            .transform_value(FEEDBACK_COLUMN, cumulative_change)
            .ok_or_else(|| ForecastError::MissingColumn(FEEDBACK_COLUMN.to_string()))?;

        let mut new_row: Array1<f32> = window.row(sequence_length - 1).to_owned();
        new_row[feedback_idx] = scaled_feedback as f32;

        let mut shifted = Array2::<f32>::zeros((sequence_length, n_features));
        shifted
            .slice_mut(s![..sequence_length - 1, ..])
            .assign(&window.slice(s![1.., ..]));
        shifted.row_mut(sequence_length - 1).assign(&new_row);
        window = shifted;
    }

    Ok(Some(steps))
}
