// External crates
use anyhow::{bail, Context, Result};
use burn::tensor::backend::Backend;
use polars::prelude::DataFrame;
use std::env;
use std::path::{Path, PathBuf};

use ferrocast::constants;
use ferrocast::error::ForecastError;
use ferrocast::evaluation;
use ferrocast::hybrid::step_1_tensor_preparation::build_sequences;
use ferrocast::hybrid::step_4_train_model::{train_model, InferenceBackend, TrainingConfig};
use ferrocast::service::{ForecastRequest, ServiceConfig, ServiceContext};
use ferrocast::util::feature_engineering::add_technical_indicators;
use ferrocast::util::model_utils;
use ferrocast::util::pre_processor::load_price_bars;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(|s| s.as_str()) {
        Some("train") => {
            if args.len() < 4 {
                usage();
            }
            let checkpoint_dir = PathBuf::from(&args[2]);
            let csv_paths: Vec<PathBuf> = args[3..].iter().map(PathBuf::from).collect();
            run_training(&checkpoint_dir, &csv_paths)
        }
        Some("forecast") => {
            if args.len() < 5 {
                usage();
            }
            let days_ahead = args
                .get(5)
                .map(|s| s.parse::<usize>())
                .transpose()
                .context("days_ahead must be an integer")?
                .unwrap_or(constants::DEFAULT_FORECAST_HORIZON);
            run_forecast(
                Path::new(&args[2]),
                Path::new(&args[3]),
                &args[4],
                days_ahead,
            )
        }
        Some("evaluate") => {
            if args.len() < 4 {
                usage();
            }
            run_evaluation(Path::new(&args[2]), Path::new(&args[3]))
        }
        _ => usage(),
    }
}

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  ferrocast train <checkpoint_dir> <bars.csv> [more.csv ...]");
    eprintln!("  ferrocast forecast <checkpoint_dir> <bars.csv> <symbol> [days_ahead]");
    eprintln!("  ferrocast evaluate <checkpoint_dir> <bars.csv>");
    std::process::exit(2);
}

fn engineer_features(csv_path: &Path) -> Result<DataFrame> {
    let mut bars = load_price_bars(csv_path)?;
    let features = add_technical_indicators(&mut bars)
        .with_context(|| format!("Feature pipeline failed for {}", csv_path.display()))?;
    Ok(features)
}

fn run_training(checkpoint_dir: &Path, csv_paths: &[PathBuf]) -> Result<()> {
    let mut frames = Vec::with_capacity(csv_paths.len());
    for path in csv_paths {
        let features = engineer_features(path)?;
        println!(
            "{}: {} usable feature rows",
            path.display(),
            features.height()
        );
        frames.push(features);
    }

    let config = TrainingConfig::default();
    let device = Default::default();
    let checkpoint_base = model_utils::checkpoint_base(checkpoint_dir);
    std::fs::create_dir_all(checkpoint_dir).context("Failed to create checkpoint directory")?;

    let (_, history) = train_model(&frames, &config, &device, &checkpoint_base)?;

    if let Some(best) = history
        .iter()
        .min_by(|a, b| a.val_loss.total_cmp(&b.val_loss))
    {
        println!(
            "Training finished after {} epochs; best val loss {:.6} at epoch {}",
            history.len(),
            best.val_loss,
            best.epoch
        );
    }
    println!("Checkpoint: {}", checkpoint_base.display());
    Ok(())
}

fn run_forecast(
    checkpoint_dir: &Path,
    csv_path: &Path,
    symbol: &str,
    days_ahead: usize,
) -> Result<()> {
    let service_config = ServiceConfig::new(checkpoint_dir);
    let device = Default::default();
    let context = ServiceContext::<InferenceBackend>::load(&service_config, device)?;

    if !csv_path.exists() {
        return Err(ForecastError::UnknownSymbol(symbol.to_string()).into());
    }
    let bars = load_price_bars(csv_path)?;

    let request = ForecastRequest::new(symbol, days_ahead);
    match context.forecast(&request, &bars)? {
        Some(response) => {
            println!(
                "{} @ {} (close {:.2})",
                response.symbol, response.current_date, response.current_price
            );
            for step in &response.predictions {
                println!(
                    "  {}  {:>10.2}  ({:+.2}%)",
                    step.date, step.predicted_price, step.predicted_return
                );
            }
            Ok(())
        }
        None => {
            bail!(
                "Not enough usable history for {} to produce a forecast",
                symbol
            );
        }
    }
}

fn run_evaluation(checkpoint_dir: &Path, csv_path: &Path) -> Result<()> {
    let device = <InferenceBackend as Backend>::Device::default();
    let (model, metadata, scaler) =
        model_utils::load_trained_model::<InferenceBackend>(checkpoint_dir, &device)?;

    let features_df = engineer_features(csv_path)?;
    let mut scaled = features_df.clone();
    scaler
        .transform(&mut scaled)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let (features, targets) = build_sequences::<InferenceBackend>(
        &scaled,
        &metadata.feature_columns,
        metadata.sequence_length,
        &device,
    )
    .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Held-out slice: the most recent 15% of sequences
    let num_samples = features.dims()[0];
    let holdout = ((num_samples as f64) * 0.15).round().max(1.0) as usize;
    let start = num_samples - holdout;
    let report = evaluation::evaluate_model(
        &model,
        features.narrow(0, start, holdout),
        targets.narrow(0, start, holdout),
    )?;

    println!("Evaluation over {} held-out sequences:", holdout);
    println!("  RMSE (returns):       {:.6}", report.rmse);
    println!("  MAE (returns):        {:.6}", report.mae);
    println!("  R^2 (returns):        {:.4}", report.r2);
    println!("  MAPE (returns):       {:.2}%", report.mape);
    println!("  Directional accuracy: {:.2}%", report.directional_accuracy);
    Ok(())
}
