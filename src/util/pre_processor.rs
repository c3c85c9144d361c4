// External crates
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use polars::prelude::*;
use std::path::Path;

/// Columns every price-bar frame must carry.
pub const REQUIRED_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// One daily OHLCV bar. Bars are immutable once ingested and ordered by
/// trade date ascending, unique per symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceBar {
    pub symbol: String,
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Loads a CSV of daily bars into a validated DataFrame.
///
/// The frame is sorted by `trade_date`, numeric columns are cast to Float64,
/// and rows with missing values are dropped before anything downstream sees
/// them.
pub fn load_price_bars(full_path: &Path) -> Result<DataFrame> {
    log::info!("Loading price bars from: {}", full_path.display());

    if !full_path.exists() {
        bail!("File not found: {}", full_path.display());
    }

    let file = std::fs::File::open(full_path)
        .with_context(|| format!("Failed to open {}", full_path.display()))?;
    let mut df = CsvReader::new(file)
        .finish()
        .context("Failed to parse price-bar CSV")?;

    for &col in &REQUIRED_COLUMNS {
        if df.column(col).is_err() {
            bail!("Required column '{}' not found", col);
        }
    }

    for &col in &REQUIRED_COLUMNS {
        let series = df.column(col)?.as_materialized_series().clone();
        let cast = series.cast(&DataType::Float64)?;
        df.replace(col, cast)?;
    }

    if df.column("trade_date").is_ok() {
        df = df.sort(vec!["trade_date"], SortMultipleOptions::default())?;
    }

    df = df.drop_nulls::<String>(None)?;

    Ok(df)
}

/// Builds a price-bar DataFrame from typed bars, for callers that do not go
/// through the CSV path.
pub fn bars_to_dataframe(bars: &[PriceBar]) -> PolarsResult<DataFrame> {
    let symbol: Vec<String> = bars.iter().map(|b| b.symbol.clone()).collect();
    let trade_date: Vec<String> = bars
        .iter()
        .map(|b| b.trade_date.format("%Y-%m-%d").to_string())
        .collect();
    let open: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let high: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let low: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let close: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volume: Vec<f64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Series::new("symbol".into(), symbol).into_column(),
        Series::new("trade_date".into(), trade_date).into_column(),
        Series::new("open".into(), open).into_column(),
        Series::new("high".into(), high).into_column(),
        Series::new("low".into(), low).into_column(),
        Series::new("close".into(), close).into_column(),
        Series::new("volume".into(), volume).into_column(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_price_bars_missing_file() {
        let result = load_price_bars(Path::new("does_not_exist.csv"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    fn test_load_price_bars_sorts_and_casts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bars.csv");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "symbol,trade_date,open,high,low,close,volume")?;
        writeln!(file, "AAPL,2024-01-03,3,4,2,3,300")?;
        writeln!(file, "AAPL,2024-01-02,2,3,1,2,200")?;
        writeln!(file, "AAPL,2024-01-01,1,2,1,1,100")?;

        let df = load_price_bars(&path)?;
        assert_eq!(df.height(), 3);

        let close = df.column("close")?.f64()?.clone();
        assert_eq!(close.get(0), Some(1.0));
        assert_eq!(close.get(2), Some(3.0));
        Ok(())
    }

    #[test]
    fn test_load_price_bars_rejects_missing_column() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.csv");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "symbol,trade_date,open,high,low,close")?;
        writeln!(file, "AAPL,2024-01-01,1,2,1,1")?;

        let result = load_price_bars(&path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("volume"));
        Ok(())
    }

    #[test]
    fn test_bars_to_dataframe_round_trip() {
        let bars = vec![PriceBar {
            symbol: "MSFT".to_string(),
            trade_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 1_000_000.0,
        }];

        let df = bars_to_dataframe(&bars).unwrap();
        assert_eq!(df.height(), 1);
        let date = df.column("trade_date").unwrap().str().unwrap().get(0);
        assert_eq!(date, Some("2024-06-03"));
    }
}
