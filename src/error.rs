use polars::prelude::PolarsError;
use thiserror::Error;

/// Failure taxonomy for the forecast path.
///
/// Insufficient history is deliberately not a variant: the engine reports it
/// as `Ok(None)` so the serving layer can map it to a not-found response
/// without string-matching error messages.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("days_ahead must be between {min} and {max}, got {requested}")]
    HorizonOutOfRange {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("required column '{0}' is missing")]
    MissingColumn(String),

    #[error("could not parse trade date '{0}'")]
    InvalidDate(String),

    #[error("non-finite value during {stage} for {symbol}")]
    Numerical { symbol: String, stage: &'static str },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Data(#[from] PolarsError),
}

impl ForecastError {
    /// Client errors are the caller's fault (bad request, unknown symbol);
    /// everything else maps to a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ForecastError::HorizonOutOfRange { .. } | ForecastError::UnknownSymbol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        let horizon = ForecastError::HorizonOutOfRange {
            requested: 400,
            min: 1,
            max: 365,
        };
        assert!(horizon.is_client_error());
        assert!(ForecastError::UnknownSymbol("ZZZZ".to_string()).is_client_error());

        let numerical = ForecastError::Numerical {
            symbol: "AAPL".to_string(),
            stage: "model forward",
        };
        assert!(!numerical.is_client_error());
        assert!(!ForecastError::Checkpoint("missing".to_string()).is_client_error());
    }

    #[test]
    fn test_error_messages_name_the_context() {
        let err = ForecastError::Numerical {
            symbol: "MSFT".to_string(),
            stage: "price reconstruction",
        };
        let rendered = err.to_string();
        assert!(rendered.contains("MSFT"));
        assert!(rendered.contains("price reconstruction"));
    }
}
