// External crates
use polars::frame::column::Column;
use polars::prelude::*;

use crate::constants::FEATURE_COLUMNS;

/// Materializes a Float64 column into a plain vector.
fn column_f64(df: &DataFrame, column: &str) -> PolarsResult<Vec<f64>> {
    let ca = df.column(column)?.f64()?.clone();
    Ok((0..ca.len()).map(|i| ca.get(i).unwrap_or(f64::NAN)).collect())
}

fn opt_series(name: &str, values: Vec<Option<f64>>) -> Series {
    Series::new(name.into(), values)
}

/// Calculates Simple Moving Average (SMA) over a fixed window
pub fn calculate_sma(df: &DataFrame, column: &str, window: usize) -> PolarsResult<Series> {
    let series = df.column(column)?.f64()?.clone().into_series();

    if series.len() < window {
        return Err(PolarsError::ComputeError(
            format!(
                "Not enough data points ({}) for SMA window ({})",
                series.len(),
                window
            )
            .into(),
        ));
    }

    series.rolling_mean(RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        center: false,
        weights: None,
        fn_params: None,
    })
}

/// Recursive exponential moving average with alpha = 2 / (window + 1), seeded
/// from the first value. The first window - 1 entries are masked out so the
/// downstream null drop treats them as warm-up.
fn ema_values(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    if values.is_empty() {
        return out;
    }

    let alpha = 2.0 / (window as f64 + 1.0);
    let mut ema = values[0];
    for (i, &value) in values.iter().enumerate() {
        if i > 0 {
            ema = alpha * value + (1.0 - alpha) * ema;
        }
        out.push(if i + 1 >= window { Some(ema) } else { None });
    }
    out
}

/// Calculates Exponential Moving Average (EMA)
pub fn calculate_ema(df: &DataFrame, column: &str, window: usize) -> PolarsResult<Series> {
    let values = column_f64(df, column)?;

    if values.len() < window {
        return Err(PolarsError::ComputeError(
            format!(
                "Not enough data points ({}) for EMA window ({})",
                values.len(),
                window
            )
            .into(),
        ));
    }

    Ok(opt_series("ema", ema_values(&values, window)))
}

/// Calculates Relative Strength Index (RSI) with Wilder smoothing
pub fn calculate_rsi(df: &DataFrame, window: usize) -> PolarsResult<Series> {
    let close = column_f64(df, "close")?;
    let n = close.len();

    if n <= window {
        return Ok(opt_series("rsi", vec![None; n]));
    }

    let mut gains = vec![0.0; n];
    let mut losses = vec![0.0; n];
    for i in 1..n {
        let change = close[i] - close[i - 1];
        if change > 0.0 {
            gains[i] = change;
        } else {
            losses[i] = -change;
        }
    }

    let mut rsi: Vec<Option<f64>> = vec![None; n];
    let mut avg_gain = gains[1..=window].iter().sum::<f64>() / window as f64;
    let mut avg_loss = losses[1..=window].iter().sum::<f64>() / window as f64;
    rsi[window] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in window + 1..n {
        avg_gain = (avg_gain * (window as f64 - 1.0) + gains[i]) / window as f64;
        avg_loss = (avg_loss * (window as f64 - 1.0) + losses[i]) / window as f64;
        rsi[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    Ok(opt_series("rsi", rsi))
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }
}

/// Calculates the MACD line, its signal line, and their difference
pub fn calculate_macd(df: &DataFrame) -> PolarsResult<(Series, Series, Series)> {
    // MACD requires at least 26 points for the longer EMA
    if df.height() < 26 {
        return Err(PolarsError::ComputeError(
            "Not enough data points for MACD calculation (need at least 26)".into(),
        ));
    }

    let close = column_f64(df, "close")?;
    let n = close.len();
    let ema12 = ema_values(&close, 12);
    let ema26 = ema_values(&close, 26);

    let macd: Vec<Option<f64>> = ema12
        .iter()
        .zip(ema26.iter())
        .map(|(short, long)| match (short, long) {
            (Some(s), Some(l)) => Some(s - l),
            _ => None,
        })
        .collect();

    // Signal line: EMA-9 over the populated region of the MACD line
    let mut signal: Vec<Option<f64>> = vec![None; n];
    if let Some(start) = macd.iter().position(|v| v.is_some()) {
        let valid: Vec<f64> = macd[start..].iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        for (offset, value) in ema_values(&valid, 9).into_iter().enumerate() {
            signal[start + offset] = value;
        }
    }

    let diff: Vec<Option<f64>> = macd
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    Ok((
        opt_series("macd", macd),
        opt_series("macd_signal", signal),
        opt_series("macd_diff", diff),
    ))
}

/// Calculates the stochastic oscillator %K and its smoothed %D
pub fn calculate_stochastic(
    df: &DataFrame,
    window: usize,
    smooth: usize,
) -> PolarsResult<(Series, Series)> {
    let high = column_f64(df, "high")?;
    let low = column_f64(df, "low")?;
    let close = column_f64(df, "close")?;
    let n = close.len();

    let mut stoch_k: Vec<Option<f64>> = vec![None; n];
    for i in (window - 1)..n {
        let span = (i + 1 - window)..=i;
        let lowest = low[span.clone()].iter().cloned().fold(f64::INFINITY, f64::min);
        let highest = high[span].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        // A flat range yields a division by zero; the non-finite result is
        // nulled out by the sanitize pass.
        stoch_k[i] = Some((close[i] - lowest) / (highest - lowest) * 100.0);
    }

    let mut stoch_d: Vec<Option<f64>> = vec![None; n];
    for i in 0..n {
        if i + 1 >= smooth {
            let span = &stoch_k[(i + 1 - smooth)..=i];
            if span.iter().all(|v| v.is_some()) {
                let sum: f64 = span.iter().map(|v| v.unwrap_or(0.0)).sum();
                stoch_d[i] = Some(sum / smooth as f64);
            }
        }
    }

    Ok((opt_series("stoch_k", stoch_k), opt_series("stoch_d", stoch_d)))
}

/// Calculates Bollinger Bands and the normalized band width
pub fn calculate_bollinger_bands(
    df: &DataFrame,
    window: usize,
    num_std: f64,
) -> PolarsResult<(Series, Series, Series, Series)> {
    let close = df.column("close")?.f64()?.clone().into_series();

    if close.len() < window {
        return Err(PolarsError::ComputeError(
            format!(
                "Not enough data points ({}) for Bollinger Bands window ({})",
                close.len(),
                window
            )
            .into(),
        ));
    }

    let mid = close.rolling_mean(RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        center: false,
        weights: None,
        fn_params: None,
    })?;
    let std = close.rolling_std(RollingOptionsFixedWindow {
        window_size: window,
        min_periods: window,
        center: false,
        weights: None,
        fn_params: None,
    })?;

    let mid_ca = mid.f64()?;
    let std_ca = std.f64()?;
    let mut upper: Vec<Option<f64>> = Vec::with_capacity(close.len());
    let mut lower: Vec<Option<f64>> = Vec::with_capacity(close.len());
    let mut width: Vec<Option<f64>> = Vec::with_capacity(close.len());

    for i in 0..close.len() {
        match (mid_ca.get(i), std_ca.get(i)) {
            (Some(m), Some(s)) => {
                let u = m + num_std * s;
                let l = m - num_std * s;
                upper.push(Some(u));
                lower.push(Some(l));
                width.push(Some((u - l) / m));
            }
            _ => {
                upper.push(None);
                lower.push(None);
                width.push(None);
            }
        }
    }

    Ok((
        opt_series("bb_upper", upper),
        opt_series("bb_lower", lower),
        mid.with_name("bb_mid".into()),
        opt_series("bb_width", width),
    ))
}

/// Calculates Average True Range (ATR) with Wilder smoothing
pub fn calculate_atr(df: &DataFrame, window: usize) -> PolarsResult<Series> {
    let high = column_f64(df, "high")?;
    let low = column_f64(df, "low")?;
    let close = column_f64(df, "close")?;
    let n = close.len();

    if n < window + 1 {
        return Err(PolarsError::ComputeError(
            format!(
                "Not enough data points ({}) for ATR calculation (need {})",
                n,
                window + 1
            )
            .into(),
        ));
    }

    let mut tr = Vec::with_capacity(n);
    tr.push(high[0] - low[0]);
    for i in 1..n {
        let prev_close = close[i - 1];
        let range = (high[i] - low[i])
            .max((high[i] - prev_close).abs())
            .max((low[i] - prev_close).abs());
        tr.push(range);
    }

    let mut atr: Vec<Option<f64>> = vec![None; n];
    let mut current = tr[0..window].iter().sum::<f64>() / window as f64;
    atr[window - 1] = Some(current);
    for i in window..n {
        current = (current * (window as f64 - 1.0) + tr[i]) / window as f64;
        atr[i] = Some(current);
    }

    Ok(opt_series("atr", atr))
}

/// Calculates the cumulative on-balance-volume indicator
pub fn calculate_obv(df: &DataFrame) -> PolarsResult<Series> {
    let close = column_f64(df, "close")?;
    let volume = column_f64(df, "volume")?;
    let n = close.len();

    let mut out: Vec<Option<f64>> = Vec::with_capacity(n);
    if n == 0 {
        return Ok(opt_series("obv", out));
    }

    let mut obv = volume[0];
    out.push(Some(obv));
    for i in 1..n {
        if close[i] < close[i - 1] {
            obv -= volume[i];
        } else {
            obv += volume[i];
        }
        out.push(Some(obv));
    }

    Ok(opt_series("obv", out))
}

/// Calculates simple period-over-period returns for a column
pub fn calculate_returns(df: &DataFrame, column: &str) -> PolarsResult<Series> {
    let values = column_f64(df, column)?;
    let mut out: Vec<Option<f64>> = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if i == 0 {
            out.push(None);
        } else {
            out.push(Some((values[i] - values[i - 1]) / values[i - 1]));
        }
    }
    Ok(opt_series("returns", out))
}

/// Calculates log returns of the close price
pub fn calculate_log_returns(df: &DataFrame) -> PolarsResult<Series> {
    let close = column_f64(df, "close")?;
    let mut out: Vec<Option<f64>> = Vec::with_capacity(close.len());
    for i in 0..close.len() {
        if i == 0 {
            out.push(None);
        } else {
            out.push(Some((close[i] / close[i - 1]).ln()));
        }
    }
    Ok(opt_series("log_returns", out))
}

/// Calculates the high-low and open-close spreads, both normalized by close
pub fn calculate_spreads(df: &DataFrame) -> PolarsResult<(Series, Series)> {
    let open = column_f64(df, "open")?;
    let high = column_f64(df, "high")?;
    let low = column_f64(df, "low")?;
    let close = column_f64(df, "close")?;

    let mut high_low: Vec<Option<f64>> = Vec::with_capacity(close.len());
    let mut open_close: Vec<Option<f64>> = Vec::with_capacity(close.len());
    for i in 0..close.len() {
        high_low.push(Some((high[i] - low[i]) / close[i]));
        open_close.push(Some((open[i] - close[i]) / close[i]));
    }

    Ok((
        opt_series("high_low_spread", high_low),
        opt_series("open_close_spread", open_close),
    ))
}

/// Replaces non-finite entries in the given columns with nulls so the final
/// drop removes every row that touched a zero denominator.
fn replace_non_finite_with_null(df: &mut DataFrame, columns: &[&str]) -> PolarsResult<()> {
    for &column in columns {
        let ca = df.column(column)?.f64()?.clone();
        let sanitized: Vec<Option<f64>> = (0..ca.len())
            .map(|i| ca.get(i).filter(|v| v.is_finite()))
            .collect();
        df.replace(column, opt_series(column, sanitized))?;
    }
    Ok(())
}

/// Adds all technical indicators to the DataFrame.
///
/// The input must carry `open`, `high`, `low`, `close`, and `volume` columns
/// ordered by trade date. Output rows are aligned 1:1 with the input after
/// the warm-up drop: rows with any null or non-finite indicator value are
/// removed, so a gap-free M-row input yields M - 199 feature rows (the
/// 200-bar SMA is the longest lookback). The computation is causal and fully
/// deterministic.
pub fn add_technical_indicators(df: &mut DataFrame) -> PolarsResult<DataFrame> {
    // Convert numeric columns to Float64 by mutating in-place via Column
    let numeric_columns = ["open", "high", "low", "close", "volume"];
    for col_name in numeric_columns {
        let s: Series = df.column(col_name)?.as_materialized_series().clone();
        let mut col: Column = s.into_column();

        let series_mut: &mut Series = col.into_materialized_series();
        *series_mut = series_mut.cast(&DataType::Float64)?;

        let series: Series = col.take_materialized_series();
        df.replace(col_name, series)?;
    }

    // Return measures
    let returns = calculate_returns(df, "close")?;
    let log_returns = calculate_log_returns(df)?;
    let (high_low_spread, open_close_spread) = calculate_spreads(df)?;

    // Trend
    let sma20 = calculate_sma(df, "close", 20)?;
    let sma50 = calculate_sma(df, "close", 50)?;
    let sma200 = calculate_sma(df, "close", 200)?;
    let ema12 = calculate_ema(df, "close", 12)?;
    let ema26 = calculate_ema(df, "close", 26)?;
    let (macd, macd_signal, macd_diff) = calculate_macd(df)?;

    // Momentum
    let rsi = calculate_rsi(df, 14)?;
    let (stoch_k, stoch_d) = calculate_stochastic(df, 14, 3)?;

    // Volatility
    let (bb_upper, bb_lower, bb_mid, bb_width) = calculate_bollinger_bands(df, 20, 2.0)?;
    let atr = calculate_atr(df, 14)?;

    // Volume
    let obv = calculate_obv(df)?;
    let volume_change = calculate_returns(df, "volume")?;
    let volume_sma20 = calculate_sma(df, "volume", 20)?;

    let all_indicators: Vec<Series> = vec![
        returns.with_name("returns".into()),
        log_returns.with_name("log_returns".into()),
        high_low_spread.with_name("high_low_spread".into()),
        open_close_spread.with_name("open_close_spread".into()),
        sma20.with_name("sma_20".into()),
        sma50.with_name("sma_50".into()),
        sma200.with_name("sma_200".into()),
        ema12.with_name("ema_12".into()),
        ema26.with_name("ema_26".into()),
        macd.with_name("macd".into()),
        macd_signal.with_name("macd_signal".into()),
        macd_diff.with_name("macd_diff".into()),
        rsi.with_name("rsi_14".into()),
        stoch_k.with_name("stoch_k".into()),
        stoch_d.with_name("stoch_d".into()),
        bb_upper.with_name("bb_upper".into()),
        bb_lower.with_name("bb_lower".into()),
        bb_mid.with_name("bb_mid".into()),
        bb_width.with_name("bb_width".into()),
        atr.with_name("atr_14".into()),
        obv.with_name("obv".into()),
        volume_change.with_name("volume_change".into()),
        volume_sma20.with_name("volume_sma_20".into()),
    ];

    let columns: Vec<Column> = all_indicators.into_iter().map(|s| s.into_column()).collect();
    let mut result = df.hstack(&columns)?;

    replace_non_finite_with_null(&mut result, &FEATURE_COLUMNS)?;
    let result = result.drop_nulls::<String>(None)?;

    Ok(result)
}
