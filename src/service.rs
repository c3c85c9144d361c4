//! Forecast service surface consumed by the (out-of-scope) HTTP layer.
//!
//! There is no lazily-initialized global here: a [`ServiceContext`] is built
//! once at process startup and handed to request handlers behind an `Arc`.
//! Weights are never mutated after load and every forecast allocates its own
//! window buffers, so one context serves concurrent requests.

use burn::tensor::backend::Backend;
use chrono::NaiveDate;
use log::{error, info};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::constants::{DEFAULT_FORECAST_HORIZON, MAX_FORECAST_HORIZON, MIN_FORECAST_HORIZON};
use crate::error::ForecastError;
use crate::hybrid::step_1_tensor_preparation::FeatureScaler;
use crate::hybrid::step_3_model_arch::HybridRecurrentModel;
use crate::hybrid::step_5_forecast::{generate_forecast, round2, ForecastStep};
use crate::hybrid::step_6_model_serialization::CheckpointMetadata;
use crate::util::feature_engineering::add_technical_indicators;
use crate::util::model_utils;

/// Where the service finds its persisted artifacts.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub checkpoint_dir: PathBuf,
}

impl ServiceConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
        }
    }
}

/// A forecast request from the serving layer. `days_ahead` defaults to 5 and
/// must stay within [1, 365]; violations are client errors.
#[derive(Debug, Clone, Deserialize)]
pub struct ForecastRequest {
    pub symbol: String,
    #[serde(default = "default_days_ahead")]
    pub days_ahead: usize,
}

fn default_days_ahead() -> usize {
    DEFAULT_FORECAST_HORIZON
}

impl ForecastRequest {
    pub fn new(symbol: impl Into<String>, days_ahead: usize) -> Self {
        Self {
            symbol: symbol.into(),
            days_ahead,
        }
    }

    /// Rejects out-of-range horizons before any model work happens.
    pub fn validate(&self) -> Result<(), ForecastError> {
        if !(MIN_FORECAST_HORIZON..=MAX_FORECAST_HORIZON).contains(&self.days_ahead) {
            return Err(ForecastError::HorizonOutOfRange {
                requested: self.days_ahead,
                min: MIN_FORECAST_HORIZON,
                max: MAX_FORECAST_HORIZON,
            });
        }
        Ok(())
    }
}

/// The wire response: current state plus the ordered forecast steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastResponse {
    pub symbol: String,
    pub current_price: f64,
    pub current_date: String,
    pub predictions: Vec<ForecastStep>,
}

/// Loaded model, scaler, and metadata, shared read-only across requests.
pub struct ServiceContext<B: Backend> {
    model: HybridRecurrentModel<B>,
    metadata: CheckpointMetadata,
    scaler: FeatureScaler,
    device: B::Device,
}

impl<B: Backend> ServiceContext<B> {
    /// Loads the checkpoint once; call at process startup and share the
    /// returned handle.
    pub fn load(config: &ServiceConfig, device: B::Device) -> Result<Arc<Self>, ForecastError> {
        let (model, metadata, scaler) =
            model_utils::load_trained_model::<B>(&config.checkpoint_dir, &device)
                .map_err(|e| ForecastError::Checkpoint(e.to_string()))?;

        info!(
            "Service context ready: {} features, window {}",
            metadata.feature_columns.len(),
            metadata.sequence_length
        );

        Ok(Arc::new(Self {
            model,
            metadata,
            scaler,
            device,
        }))
    }

    /// Builds a context from already-loaded artifacts.
    pub fn from_parts(
        model: HybridRecurrentModel<B>,
        metadata: CheckpointMetadata,
        scaler: FeatureScaler,
        device: B::Device,
    ) -> Arc<Self> {
        Arc::new(Self {
            model,
            metadata,
            scaler,
            device,
        })
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// Runs the full forecast path for one request over the symbol's price
    /// bars: validation, feature engineering, then the autoregressive engine.
    ///
    /// `Ok(None)` means the symbol's usable history is too short for a
    /// forecast; the serving layer maps it to a not-found response. `Err` is
    /// either a client error (`is_client_error`) or a computation failure.
    pub fn forecast(
        &self,
        request: &ForecastRequest,
        bars: &DataFrame,
    ) -> Result<Option<ForecastResponse>, ForecastError> {
        request.validate()?;

        // Too few bars to survive indicator warm-up with L + 1 rows left:
        // the documented absence outcome, decided before the pipeline runs
        let min_bars = crate::constants::INDICATOR_WARMUP + self.metadata.sequence_length + 1;
        if bars.height() < min_bars {
            return Ok(None);
        }

        let mut bars = bars.clone();
        let features = add_technical_indicators(&mut bars).map_err(|e| {
            error!("{}: feature pipeline failed: {}", request.symbol, e);
            ForecastError::Data(e)
        })?;

        let steps = match generate_forecast(
            &self.model,
            &self.scaler,
            &self.metadata.feature_columns,
            &features,
            &request.symbol,
            self.metadata.sequence_length,
            request.days_ahead,
            &self.device,
        )? {
            Some(steps) => steps,
            None => return Ok(None),
        };

        let close = features.column("close")?.f64()?.clone();
        let current_price = close
            .get(close.len() - 1)
            .ok_or_else(|| ForecastError::MissingColumn("close".to_string()))?;
        let dates = features.column("trade_date")?.str()?.clone();
        let current_date = dates
            .get(dates.len() - 1)
            .ok_or_else(|| ForecastError::MissingColumn("trade_date".to_string()))?
            .to_string();
        // The response carries the ISO date; parse to assert well-formedness
        NaiveDate::parse_from_str(&current_date, "%Y-%m-%d")
            .map_err(|_| ForecastError::InvalidDate(current_date.clone()))?;

        Ok(Some(ForecastResponse {
            symbol: request.symbol.clone(),
            current_price: round2(current_price),
            current_date,
            predictions: steps,
        }))
    }
}
