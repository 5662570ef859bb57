//! Ensemble forecasting CLI
//!
//! Runs the engine end to end over synthetic market data.

use clap::{Parser, Subcommand};
use ensemble_forecast::{
    config::Config,
    ensemble::{EnsembleManager, OptimizationMethod},
    logging,
    model::{DriftModel, ParamSet, SignalKind, SignalModel},
    monitor::{ModelHealthChecker, PerformanceMonitor},
    testing::{synthetic_frame, SyntheticConfig},
    types::MarketFrame,
    validation::{param_grid, CancelToken, WalkForwardOptimizer},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "ensemble-forecast")]
#[command(about = "Ensemble direction forecasting with walk-forward validation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Rows of synthetic daily data
    #[arg(long, default_value = "400")]
    rows: usize,

    /// Seed for the synthetic data
    #[arg(long, default_value = "7")]
    seed: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk-forward backtest of the reference pipeline
    Backtest {
        /// Abort windows still running after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Train, optimize weights and forecast the next horizon
    Forecast {
        /// nnls, inverse_error, accuracy or equal
        #[arg(short, long)]
        method: Option<OptimizationMethod>,
    },
    /// Replay the last rows through the performance monitor
    Monitor {
        /// Rows to replay
        #[arg(short, long, default_value = "60")]
        replay: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    logging::init(&config.logging);

    let frame = synthetic_frame(&SyntheticConfig {
        rows: cli.rows,
        seed: cli.seed,
        ..Default::default()
    });

    match cli.command {
        Commands::Backtest { timeout_secs } => backtest(config, frame, timeout_secs).await,
        Commands::Forecast { method } => forecast(config, &frame, method),
        Commands::Monitor { replay } => monitor(config, &frame, replay),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.to_json()?)?);
            Ok(())
        }
    }
}

fn reference_pipeline(config: &Config, params: &ParamSet) -> ensemble_forecast::Result<EnsembleManager> {
    EnsembleManager::new(config.clone())
        .with_model(Box::new(DriftModel::from_params("drift", params)))?
        .with_model(Box::new(SignalModel::from_params(
            "momentum",
            SignalKind::Momentum,
            params,
        )))?
        .with_model(Box::new(SignalModel::from_params(
            "mean_reversion",
            SignalKind::MeanReversion,
            params,
        )))?
        .with_model(Box::new(SignalModel::from_params(
            "feature",
            SignalKind::Feature(1),
            params,
        )))
}

async fn backtest(config: Config, frame: MarketFrame, timeout_secs: Option<u64>) -> anyhow::Result<()> {
    let mut space = BTreeMap::new();
    space.insert("lookback".to_string(), vec![5.0, 10.0, 20.0]);
    space.insert("ridge".to_string(), vec![0.0, 0.01]);

    let optimizer = WalkForwardOptimizer::new(config.walk_forward.clone(), param_grid(&space));
    let cancel = match timeout_secs {
        Some(secs) => CancelToken::with_timeout(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling remaining windows");
            shutdown.cancel();
        }
    });

    let factory = move |params: &ParamSet| reference_pipeline(&config, params);
    let report = optimizer
        .run_backtest_concurrent(Arc::new(frame), Arc::new(factory), cancel)
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn forecast(
    config: Config,
    frame: &MarketFrame,
    method: Option<OptimizationMethod>,
) -> anyhow::Result<()> {
    let mut manager = reference_pipeline(&config, &ParamSet::new())?;
    let trained = manager.train(frame)?;
    tracing::info!("Trained models: {:?}", trained);

    let update = manager.optimize_weights(frame, method)?;
    if !update.applied {
        tracing::warn!(
            "Weights unchanged: {}",
            update.reason.as_deref().unwrap_or("no reason given")
        );
    }

    let result = manager.predict(frame, None)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn monitor(config: Config, frame: &MarketFrame, replay: usize) -> anyhow::Result<()> {
    let start = frame.len().saturating_sub(replay);
    let history = frame.head(start);

    let mut manager = reference_pipeline(&config, &ParamSet::new())?;
    manager.train(&history)?;
    manager.optimize_weights(&history, None)?;

    let mut monitor = PerformanceMonitor::new(config.monitor.clone());
    for row in start..frame.len() {
        let mut view = frame.head(row + 1);
        view.labels.clear();
        view.returns.clear();

        let result = manager.predict(&view, None)?;
        if result.is_null() {
            continue;
        }
        let timestamp = view.last_timestamp().unwrap_or(result.timestamp);
        for alert in monitor.record_forecast(&result, frame.labels[row], Some(frame.returns[row]), timestamp) {
            tracing::info!("{:?} {}: {}", alert.severity, alert.alert_type, alert.message);
        }
    }

    let realized = &frame.returns[start..];
    let calibration = manager.calibrate_from_history(realized);
    monitor.record_calibration(&calibration);

    let summary = monitor.dashboard_summary(&ModelHealthChecker::new(config.health.clone()));
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
