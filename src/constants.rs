// Feature columns fed to the model, in the order the scaler and the
// checkpoint record them. The first slot ("returns") is the one the forecast
// engine rewrites on each autoregressive step.
pub const FEATURE_COLUMNS: [&str; 23] = [
    "returns",
    "log_returns",
    "high_low_spread",
    "open_close_spread",
    "sma_20",
    "sma_50",
    "sma_200",
    "ema_12",
    "ema_26",
    "macd",
    "macd_signal",
    "macd_diff",
    "rsi_14",
    "stoch_k",
    "stoch_d",
    "bb_upper",
    "bb_lower",
    "bb_mid",
    "bb_width",
    "atr_14",
    "obv",
    "volume_change",
    "volume_sma_20",
];

/// Column the forecast engine overwrites with the cumulative price change
/// relative to the last observed close.
pub const FEEDBACK_COLUMN: &str = "returns";

// Model parameters
pub const SEQUENCE_LENGTH: usize = 60; // Number of trading days to look back

/// Rows lost to indicator warm-up: the 200-bar SMA is the longest lookback,
/// so the first fully-populated feature row is at index 199.
pub const INDICATOR_WARMUP: usize = 199;

// Data preprocessing
pub const VALIDATION_SPLIT_RATIO: f64 = 0.15;

// Forecast horizon bounds (inclusive)
pub const MIN_FORECAST_HORIZON: usize = 1;
pub const MAX_FORECAST_HORIZON: usize = 365;
pub const DEFAULT_FORECAST_HORIZON: usize = 5;

// Checkpoint layout
pub const CHECKPOINT_DIR: &str = "models";
pub const CHECKPOINT_FILE_STEM: &str = "returns_model";

/// Owned copy of [`FEATURE_COLUMNS`], in the canonical order.
pub fn feature_columns() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect()
}
