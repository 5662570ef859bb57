//! Walk-forward optimizer
//!
//! Per window: search hyperparameters with time-ordered folds inside the
//! training slice, measure the winner on the validation slice, retrain on
//! train + validation and score the untouched test slice exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{CancelToken, PipelineFactory};
use crate::config::WalkForwardConfig;
use crate::error::{ForecastError, Result};
use crate::model::ParamSet;
use crate::stats;
use crate::types::MarketFrame;

/// Row boundaries of one window. Every end is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub index: usize,
    pub train_start: usize,
    pub train_end: usize,
    pub val_start: usize,
    pub val_end: usize,
    pub test_start: usize,
    pub test_end: usize,
}

impl WindowConfig {
    /// Rejects boundaries that are not strictly increasing
    pub fn new(
        index: usize,
        train: (usize, usize),
        val: (usize, usize),
        test: (usize, usize),
    ) -> Result<Self> {
        let bounds = [train.0, train.1, val.0, val.1, test.0, test.1];
        if bounds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ForecastError::Configuration(format!(
                "window {} boundaries must be strictly increasing, got {:?}",
                index, bounds
            )));
        }
        Ok(Self {
            index,
            train_start: train.0,
            train_end: train.1,
            val_start: val.0,
            val_end: val.1,
            test_start: test.0,
            test_end: test.1,
        })
    }

    pub fn train_rows(&self) -> Range<usize> {
        self.train_start..self.train_end + 1
    }

    pub fn val_rows(&self) -> Range<usize> {
        self.val_start..self.val_end + 1
    }

    pub fn test_rows(&self) -> Range<usize> {
        self.test_start..self.test_end + 1
    }

    /// Training and validation slices together, for the final refit
    pub fn train_val_rows(&self) -> Range<usize> {
        self.train_start..self.val_end + 1
    }
}

/// Outcome of one completed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub window: WindowConfig,
    pub best_params: ParamSet,
    /// Mean fold RMSE of the winning candidate
    pub cv_rmse: f64,
    pub val_rmse: f64,
    pub test_rmse: f64,
    pub divergence: f64,
    pub overfitting: bool,
    /// False when folds were too small and the validation slice was used
    pub used_kfold: bool,
    pub candidates_evaluated: usize,
    pub n_train: usize,
    pub n_val: usize,
    pub n_test: usize,
}

/// A window that did not complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowFailure {
    pub index: usize,
    pub window: Option<WindowConfig>,
    pub error: String,
    pub cancelled: bool,
}

impl WindowFailure {
    fn new(window: &WindowConfig, error: &ForecastError) -> Self {
        Self {
            index: window.index,
            window: Some(*window),
            error: error.to_string(),
            cancelled: matches!(error, ForecastError::Cancelled(_)),
        }
    }
}

/// Aggregate over every window of a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub windows: Vec<WindowResult>,
    pub failures: Vec<WindowFailure>,
    pub n_windows: usize,
    pub mean_divergence: f64,
    pub max_divergence: f64,
    /// Share of completed windows above the threshold, in percent
    pub pct_over_threshold: f64,
    pub mean_test_rmse: f64,
    pub divergence_threshold: f64,
}

impl BacktestReport {
    pub fn from_outcomes(
        mut windows: Vec<WindowResult>,
        mut failures: Vec<WindowFailure>,
        divergence_threshold: f64,
    ) -> Self {
        windows.sort_by_key(|w| w.window.index);
        failures.sort_by_key(|f| f.index);

        let divergences: Vec<f64> = windows.iter().map(|w| w.divergence).collect();
        let test_rmses: Vec<f64> = windows.iter().map(|w| w.test_rmse).collect();
        let over = windows
            .iter()
            .filter(|w| w.divergence > divergence_threshold)
            .count();
        let pct_over_threshold = if windows.is_empty() {
            0.0
        } else {
            100.0 * over as f64 / windows.len() as f64
        };

        Self {
            n_windows: windows.len() + failures.len(),
            mean_divergence: stats::mean(&divergences).unwrap_or(0.0),
            max_divergence: divergences.iter().copied().fold(0.0, f64::max),
            pct_over_threshold,
            mean_test_rmse: stats::mean(&test_rmses).unwrap_or(0.0),
            divergence_threshold,
            windows,
            failures,
        }
    }

    pub fn divergence_history(&self) -> Vec<f64> {
        self.windows.iter().map(|w| w.divergence).collect()
    }
}

/// Relative gap between validation and test error, 0 when val is 0
pub fn divergence(val_rmse: f64, test_rmse: f64) -> f64 {
    if val_rmse == 0.0 {
        0.0
    } else {
        (val_rmse - test_rmse).abs() / val_rmse
    }
}

#[derive(Debug, Clone)]
pub struct WalkForwardOptimizer {
    config: WalkForwardConfig,
    grid: Vec<ParamSet>,
}

impl WalkForwardOptimizer {
    /// `grid` lists the candidates; empty means one default candidate
    pub fn new(config: WalkForwardConfig, grid: Vec<ParamSet>) -> Self {
        let grid = if grid.is_empty() {
            vec![ParamSet::new()]
        } else {
            grid
        };
        Self { config, grid }
    }

    pub fn config(&self) -> &WalkForwardConfig {
        &self.config
    }

    pub fn grid(&self) -> &[ParamSet] {
        &self.grid
    }

    /// Fixed-size windows over `n_rows` rows, advancing by `step_days`.
    /// Stops before the first window whose test slice runs past the data.
    pub fn create_windows(&self, n_rows: usize) -> Result<Vec<WindowConfig>> {
        let c = &self.config;
        if c.step_days == 0 {
            return Err(ForecastError::Configuration(
                "walk_forward.step_days must be > 0".to_string(),
            ));
        }
        let span = c.train_days + c.val_days + c.test_days;

        let mut windows = Vec::new();
        let mut start = 0;
        while start + span <= n_rows {
            let train = (start, start + c.train_days.saturating_sub(1));
            let val_start = start + c.train_days;
            let val = (val_start, val_start + c.val_days.saturating_sub(1));
            let test_start = val_start + c.val_days;
            let test = (test_start, test_start + c.test_days.saturating_sub(1));
            windows.push(WindowConfig::new(windows.len(), train, val, test)?);
            start += c.step_days;
        }

        tracing::info!(
            "Created {} walk-forward windows over {} rows ({}/{}/{} step {})",
            windows.len(),
            n_rows,
            c.train_days,
            c.val_days,
            c.test_days,
            c.step_days
        );
        Ok(windows)
    }

    fn check_frame(frame: &MarketFrame) -> Result<()> {
        frame.validate()?;
        if !frame.has_returns() {
            return Err(ForecastError::Configuration(
                "walk-forward needs realized returns for every row".to_string(),
            ));
        }
        Ok(())
    }

    /// Search, validate, refit and test one window
    pub fn run_window<F>(
        &self,
        frame: &MarketFrame,
        window: &WindowConfig,
        factory: &F,
        cancel: &CancelToken,
    ) -> Result<WindowResult>
    where
        F: PipelineFactory + ?Sized,
    {
        cancel.check("window start")?;
        if window.test_end >= frame.len() {
            return Err(ForecastError::insufficient(
                "walk-forward window",
                window.test_end + 1,
                frame.len(),
            ));
        }

        let train = window.train_rows();
        let fold_size = train.len() / (self.config.n_folds + 1);
        let used_kfold = fold_size >= self.config.min_fold_size;
        if !used_kfold {
            tracing::debug!(
                "Window {}: fold size {} below {}, validating on the validation slice",
                window.index,
                fold_size,
                self.config.min_fold_size
            );
        }

        let mut best: Option<(f64, &ParamSet)> = None;
        let mut evaluated = 0;
        for params in &self.grid {
            cancel.check("hyperparameter candidate")?;
            let score = if used_kfold {
                self.fold_score(frame, train.start, fold_size, params, factory, cancel)?
            } else {
                score_candidate(frame, train.clone(), window.val_rows(), params, factory).ok()
            };
            evaluated += 1;

            match score {
                Some(s) if best.map(|(b, _)| s < b).unwrap_or(true) => best = Some((s, params)),
                Some(_) => {}
                None => tracing::debug!("Window {}: candidate {:?} failed", window.index, params),
            }
        }

        let (cv_rmse, best_params) = best.ok_or_else(|| {
            ForecastError::AggregationFailure(format!(
                "window {}: no hyperparameter candidate produced a score",
                window.index
            ))
        })?;
        let best_params = best_params.clone();

        cancel.check("validation scoring")?;
        let val_rmse = score_candidate(frame, train.clone(), window.val_rows(), &best_params, factory)?;

        cancel.check("test scoring")?;
        let test_rmse = score_candidate(
            frame,
            window.train_val_rows(),
            window.test_rows(),
            &best_params,
            factory,
        )?;

        let divergence = divergence(val_rmse, test_rmse);
        let overfitting = divergence > self.config.divergence_threshold;
        if overfitting {
            tracing::warn!(
                "Window {}: possible overfitting, val RMSE {:.6} vs test RMSE {:.6} (divergence {:.1}%)",
                window.index,
                val_rmse,
                test_rmse,
                divergence * 100.0
            );
        } else {
            tracing::info!(
                "Window {}: val RMSE {:.6}, test RMSE {:.6}, params {:?}",
                window.index,
                val_rmse,
                test_rmse,
                best_params
            );
        }

        Ok(WindowResult {
            window: *window,
            best_params,
            cv_rmse,
            val_rmse,
            test_rmse,
            divergence,
            overfitting,
            used_kfold,
            candidates_evaluated: evaluated,
            n_train: window.train_rows().len(),
            n_val: window.val_rows().len(),
            n_test: window.test_rows().len(),
        })
    }

    /// Mean RMSE over expanding folds, `None` when any fold fails
    fn fold_score<F>(
        &self,
        frame: &MarketFrame,
        train_start: usize,
        fold_size: usize,
        params: &ParamSet,
        factory: &F,
        cancel: &CancelToken,
    ) -> Result<Option<f64>>
    where
        F: PipelineFactory + ?Sized,
    {
        let mut scores = Vec::with_capacity(self.config.n_folds);
        for fold in 1..=self.config.n_folds {
            cancel.check("fold")?;
            let split = train_start + fold * fold_size;
            let fit = train_start..split;
            let score = split..split + fold_size;
            match score_candidate(frame, fit, score, params, factory) {
                Ok(s) => scores.push(s),
                Err(e) => {
                    tracing::debug!("Fold {} failed for {:?}: {}", fold, params, e);
                    return Ok(None);
                }
            }
        }
        Ok(stats::mean(&scores))
    }

    /// Every window in order; failed or cancelled windows are reported
    pub fn run_backtest<F>(
        &self,
        frame: &MarketFrame,
        factory: &F,
        cancel: &CancelToken,
    ) -> Result<BacktestReport>
    where
        F: PipelineFactory + ?Sized,
    {
        Self::check_frame(frame)?;
        let windows = self.create_windows(frame.len())?;

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for window in &windows {
            match self.run_window(frame, window, factory, cancel) {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!("Window {} did not complete: {}", window.index, e);
                    failures.push(WindowFailure::new(window, &e));
                }
            }
        }

        let report =
            BacktestReport::from_outcomes(results, failures, self.config.divergence_threshold);
        log_report(&report);
        Ok(report)
    }

    /// `run_backtest` with windows on a bounded pool of blocking tasks
    pub async fn run_backtest_concurrent<F>(
        &self,
        frame: Arc<MarketFrame>,
        factory: Arc<F>,
        cancel: CancelToken,
    ) -> Result<BacktestReport>
    where
        F: PipelineFactory + ?Sized + 'static,
    {
        Self::check_frame(&frame)?;
        let windows = self.create_windows(frame.len())?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let results: Arc<Mutex<Vec<WindowResult>>> = Arc::new(Mutex::new(Vec::new()));
        let failures: Arc<Mutex<Vec<WindowFailure>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(windows.len());
        for window in windows {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| ForecastError::Cancelled(format!("worker pool closed: {}", e)))?;

            let optimizer = self.clone();
            let frame = Arc::clone(&frame);
            let factory = Arc::clone(&factory);
            let cancel = cancel.clone();
            let results = Arc::clone(&results);
            let failures = Arc::clone(&failures);

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                match optimizer.run_window(&frame, &window, factory.as_ref(), &cancel) {
                    Ok(result) => results.lock().push(result),
                    Err(e) => {
                        tracing::warn!("Window {} did not complete: {}", window.index, e);
                        failures.lock().push(WindowFailure::new(&window, &e));
                    }
                }
            });
            handles.push((window.index, handle));
        }

        for (index, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!("Window {} task panicked: {}", index, e);
                failures.lock().push(WindowFailure {
                    index,
                    window: None,
                    error: format!("worker panicked: {}", e),
                    cancelled: false,
                });
            }
        }

        let results = std::mem::take(&mut *results.lock());
        let failures = std::mem::take(&mut *failures.lock());
        let report =
            BacktestReport::from_outcomes(results, failures, self.config.divergence_threshold);
        log_report(&report);
        Ok(report)
    }
}

/// Train a fresh pipeline on `fit` rows and score its return forecasts on
/// `score` rows. Each scored row sees history from `fit.start` up to itself
/// with realized outcomes hidden.
fn score_candidate<F>(
    frame: &MarketFrame,
    fit: Range<usize>,
    score: Range<usize>,
    params: &ParamSet,
    factory: &F,
) -> Result<f64>
where
    F: PipelineFactory + ?Sized,
{
    let mut pipeline = factory.build(params)?;
    pipeline.train(&frame.slice(fit.start, fit.end))?;
    if !pipeline.is_trained() {
        return Err(ForecastError::AggregationFailure(
            "no model trained on the fit slice".to_string(),
        ));
    }

    let mut predicted = Vec::with_capacity(score.len());
    let mut actual = Vec::with_capacity(score.len());
    for row in score.clone() {
        let mut view = frame.slice(fit.start, row + 1);
        view.labels.clear();
        view.returns.clear();

        let forecast = pipeline.predict(&view, None)?;
        let realized = frame.returns[row];
        if let Some(p) = forecast.forecast_return {
            if p.is_finite() && realized.is_finite() {
                predicted.push(p);
                actual.push(realized);
            }
        }
    }

    stats::rmse(&predicted, &actual)
        .ok_or_else(|| ForecastError::insufficient("walk-forward scoring", 1, 0))
}

fn log_report(report: &BacktestReport) {
    tracing::info!(
        "Backtest: {}/{} windows complete, mean divergence {:.3}, max {:.3}, {:.1}% over {:.2}",
        report.windows.len(),
        report.n_windows,
        report.mean_divergence,
        report.max_divergence,
        report.pct_over_threshold,
        report.divergence_threshold
    );
}
