//! Tests for walk-forward validation

use super::*;
use crate::config::{Config, WalkForwardConfig};
use crate::ensemble::EnsembleManager;
use crate::error::{ForecastError, Result};
use crate::model::{DriftModel, ParamSet, SignalKind, SignalModel};
use crate::testing::{synthetic_frame, SyntheticConfig};
use crate::types::MarketFrame;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn frame(rows: usize) -> MarketFrame {
    synthetic_frame(&SyntheticConfig {
        rows,
        seed: 11,
        ..Default::default()
    })
}

fn baseline_pipeline(params: &ParamSet) -> Result<EnsembleManager> {
    EnsembleManager::new(Config::default())
        .with_model(Box::new(DriftModel::from_params("drift", params)))?
        .with_model(Box::new(SignalModel::from_params(
            "momentum",
            SignalKind::Momentum,
            params,
        )))
}

fn small_config() -> WalkForwardConfig {
    WalkForwardConfig {
        train_days: 60,
        val_days: 20,
        test_days: 20,
        step_days: 20,
        ..Default::default()
    }
}

fn lookback_grid() -> Vec<ParamSet> {
    let mut space = BTreeMap::new();
    space.insert("lookback".to_string(), vec![5.0, 15.0]);
    param_grid(&space)
}

fn ten_five_five_config() -> WalkForwardConfig {
    WalkForwardConfig {
        train_days: 10,
        val_days: 5,
        test_days: 5,
        step_days: 5,
        ..Default::default()
    }
}

#[test]
fn test_windows_stop_at_data_end() {
    let optimizer = WalkForwardOptimizer::new(ten_five_five_config(), vec![]);
    let windows = optimizer.create_windows(25).unwrap();

    assert_eq!(windows.len(), 2);
    let w0 = windows[0];
    assert_eq!((w0.train_start, w0.train_end), (0, 9));
    assert_eq!((w0.val_start, w0.val_end), (10, 14));
    assert_eq!((w0.test_start, w0.test_end), (15, 19));
    let w1 = windows[1];
    assert_eq!((w1.train_start, w1.test_end), (5, 24));
}

#[test]
fn test_window_ordering_and_step() {
    let optimizer = WalkForwardOptimizer::new(ten_five_five_config(), vec![]);
    let windows = optimizer.create_windows(40).unwrap();
    assert_eq!(windows.len(), 5);

    for w in &windows {
        assert!(w.train_start < w.train_end);
        assert!(w.train_end < w.val_start);
        assert!(w.val_start < w.val_end);
        assert!(w.val_end < w.test_start);
        assert!(w.test_start < w.test_end);
        assert!(w.test_end < 40);
    }
    for pair in windows.windows(2) {
        assert_eq!(pair[1].train_start - pair[0].train_start, 5);
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
}

#[test]
fn test_short_data_yields_no_windows() {
    let optimizer = WalkForwardOptimizer::new(ten_five_five_config(), vec![]);
    assert!(optimizer.create_windows(19).unwrap().is_empty());
}

#[test]
fn test_window_rejects_overlap() {
    let err = WindowConfig::new(0, (0, 9), (9, 14), (15, 19)).unwrap_err();
    assert!(matches!(err, ForecastError::Configuration(_)));
    assert!(WindowConfig::new(0, (0, 9), (10, 14), (15, 15)).is_err());
    assert!(WindowConfig::new(0, (0, 9), (10, 14), (15, 19)).is_ok());
}

#[test]
fn test_single_day_slices_rejected() {
    let config = WalkForwardConfig {
        train_days: 10,
        val_days: 1,
        test_days: 5,
        step_days: 5,
        ..Default::default()
    };
    let optimizer = WalkForwardOptimizer::new(config, vec![]);
    assert!(matches!(
        optimizer.create_windows(50).unwrap_err(),
        ForecastError::Configuration(_)
    ));
}

#[test]
fn test_param_grid_product() {
    let mut space = BTreeMap::new();
    space.insert("lookback".to_string(), vec![5.0, 10.0]);
    space.insert("ridge".to_string(), vec![0.0, 0.1, 1.0]);
    space.insert("unused".to_string(), vec![]);

    let grid = param_grid(&space);
    assert_eq!(grid.len(), 6);
    assert!(grid.iter().all(|p| p.len() == 2));
    assert!(grid
        .iter()
        .any(|p| p["lookback"] == 10.0 && p["ridge"] == 0.1));

    assert_eq!(param_grid(&BTreeMap::new()), vec![ParamSet::new()]);
}

#[test]
fn test_divergence() {
    assert_eq!(divergence(0.0, 0.5), 0.0);
    assert!((divergence(0.10, 0.13) - 0.3).abs() < 1e-12);
    assert!((divergence(0.10, 0.08) - 0.2).abs() < 1e-12);
}

#[test]
fn test_backtest_runs_every_window() {
    let data = frame(140);
    let optimizer = WalkForwardOptimizer::new(small_config(), lookback_grid());
    let report = optimizer
        .run_backtest(&data, &baseline_pipeline, &CancelToken::new())
        .unwrap();

    assert_eq!(report.n_windows, 3);
    assert_eq!(report.windows.len(), 3);
    assert!(report.failures.is_empty());

    for (i, result) in report.windows.iter().enumerate() {
        assert_eq!(result.window.index, i);
        assert!(result.used_kfold);
        assert_eq!(result.candidates_evaluated, 2);
        assert_eq!((result.n_train, result.n_val, result.n_test), (60, 20, 20));
        assert!(result.cv_rmse.is_finite() && result.cv_rmse > 0.0);
        assert!(result.val_rmse.is_finite() && result.test_rmse.is_finite());
        assert!(
            (result.divergence - divergence(result.val_rmse, result.test_rmse)).abs() < 1e-12
        );
        assert_eq!(result.overfitting, result.divergence > 0.20);
        assert!(lookback_grid().contains(&result.best_params));
    }

    let max = report.divergence_history().into_iter().fold(0.0, f64::max);
    assert_eq!(report.max_divergence, max);
    let over = report.windows.iter().filter(|w| w.overfitting).count();
    assert!((report.pct_over_threshold - 100.0 * over as f64 / 3.0).abs() < 1e-9);
}

#[test]
fn test_small_train_falls_back_to_validation_slice() {
    let config = WalkForwardConfig {
        train_days: 20,
        val_days: 10,
        test_days: 10,
        step_days: 10,
        ..Default::default()
    };
    let data = frame(45);
    let optimizer = WalkForwardOptimizer::new(config, vec![]);
    let windows = optimizer.create_windows(data.len()).unwrap();
    assert_eq!(windows.len(), 1);

    let result = optimizer
        .run_window(&data, &windows[0], &baseline_pipeline, &CancelToken::new())
        .unwrap();
    assert!(!result.used_kfold);
    assert!((result.cv_rmse - result.val_rmse).abs() < 1e-12);
}

#[test]
fn test_cancelled_windows_are_listed() {
    let data = frame(140);
    let optimizer = WalkForwardOptimizer::new(small_config(), lookback_grid());
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = optimizer.run_backtest(&data, &baseline_pipeline, &cancel).unwrap();
    assert!(report.windows.is_empty());
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| f.cancelled));
    assert_eq!(report.n_windows, 3);
}

#[test]
fn test_deadline_cancels_window() {
    let data = frame(140);
    let optimizer = WalkForwardOptimizer::new(small_config(), lookback_grid());
    let windows = optimizer.create_windows(data.len()).unwrap();
    let expired = CancelToken::with_timeout(Duration::ZERO);

    assert!(expired.is_cancelled());
    let err = optimizer
        .run_window(&data, &windows[0], &baseline_pipeline, &expired)
        .unwrap_err();
    assert!(matches!(err, ForecastError::Cancelled(_)));
}

#[test]
fn test_failed_windows_are_not_dropped() {
    let data = frame(140);
    let optimizer = WalkForwardOptimizer::new(small_config(), vec![]);
    let broken = |_: &ParamSet| -> Result<EnsembleManager> {
        Err(ForecastError::Configuration("no models".to_string()))
    };

    let report = optimizer.run_backtest(&data, &broken, &CancelToken::new()).unwrap();
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| !f.cancelled));
    assert_eq!(report.mean_divergence, 0.0);
}

#[test]
fn test_frame_without_returns_rejected() {
    let mut data = frame(140);
    data.returns.clear();
    let optimizer = WalkForwardOptimizer::new(small_config(), vec![]);
    let err = optimizer
        .run_backtest(&data, &baseline_pipeline, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, ForecastError::Configuration(_)));
}

#[test]
fn test_report_aggregates_divergence() {
    let template = WindowResult {
        window: WindowConfig::new(0, (0, 9), (10, 14), (15, 19)).unwrap(),
        best_params: ParamSet::new(),
        cv_rmse: 0.1,
        val_rmse: 0.1,
        test_rmse: 0.11,
        divergence: 0.1,
        overfitting: false,
        used_kfold: true,
        candidates_evaluated: 1,
        n_train: 10,
        n_val: 5,
        n_test: 5,
    };
    let mut second = template.clone();
    second.window.index = 1;
    second.divergence = 0.3;
    second.overfitting = true;

    let report = BacktestReport::from_outcomes(vec![second, template], vec![], 0.2);
    assert_eq!(report.windows[0].window.index, 0);
    assert!((report.mean_divergence - 0.2).abs() < 1e-12);
    assert!((report.max_divergence - 0.3).abs() < 1e-12);
    assert!((report.pct_over_threshold - 50.0).abs() < 1e-12);
}

#[tokio::test]
async fn test_concurrent_backtest_matches_sequential() {
    let data = frame(140);
    let mut config = small_config();
    config.max_workers = 2;
    let optimizer = WalkForwardOptimizer::new(config, lookback_grid());

    let sequential = optimizer
        .run_backtest(&data, &baseline_pipeline, &CancelToken::new())
        .unwrap();
    let concurrent = optimizer
        .run_backtest_concurrent(Arc::new(data), Arc::new(baseline_pipeline), CancelToken::new())
        .await
        .unwrap();

    assert_eq!(concurrent.windows.len(), sequential.windows.len());
    for (a, b) in concurrent.windows.iter().zip(&sequential.windows) {
        assert_eq!(a.window, b.window);
        assert_eq!(a.best_params, b.best_params);
        assert_eq!(a.test_rmse, b.test_rmse);
    }
}

#[tokio::test]
async fn test_concurrent_backtest_honors_cancel() {
    let optimizer = WalkForwardOptimizer::new(small_config(), vec![]);
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = optimizer
        .run_backtest_concurrent(Arc::new(frame(140)), Arc::new(baseline_pipeline), cancel)
        .await
        .unwrap();
    assert!(report.windows.is_empty());
    assert_eq!(report.failures.len(), 3);
    assert_eq!(report.failures[2].index, 2);
}
