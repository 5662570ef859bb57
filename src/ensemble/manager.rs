//! Ensemble orchestration
//!
//! `EnsembleManager` owns the models, the live weight vector and every
//! history the engine keeps for one (symbol, horizon): weight snapshots,
//! forecasts and the error log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::uncertainty::{CalibrationRecord, EnsembleForecast, UncertaintyQuantifier};
use super::weights::{AdaptiveWeightOptimizer, OptimizationMethod, WeightOptimizer};
use crate::config::Config;
use crate::error::{ForecastError, Result};
use crate::model::{ForecastModel, ModelKind};
use crate::regime::{MarketRegime, RegimeDetector};
use crate::types::{
    Direction, ErrorRecord, ForecastResult, MarketFrame, ModelForecast, WeightVector,
};

/// A weight vector as it was installed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub timestamp: DateTime<Utc>,
    pub weights: WeightVector,
    pub method: Option<OptimizationMethod>,
    pub reason: String,
}

/// Result of `optimize_weights`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightUpdate {
    /// Weights in force after the call
    pub weights: WeightVector,
    pub applied: bool,
    pub method: OptimizationMethod,
    /// Replayed rows with a realized label
    pub n_samples: usize,
    /// Why the update was skipped
    pub reason: Option<String>,
}

/// Flat forecast history row for export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub timestamp: DateTime<Utc>,
    pub label: Direction,
    pub confidence: f64,
    pub bullish: f64,
    pub neutral: f64,
    pub bearish: f64,
    pub forecast_return: Option<f64>,
    pub forecast_volatility: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub model_agreement: f64,
    pub n_models: usize,
    pub calibrated: bool,
    pub uncertainty: f64,
    pub regime: Option<MarketRegime>,
    pub error: Option<String>,
}

impl From<&ForecastResult> for ForecastRow {
    fn from(r: &ForecastResult) -> Self {
        Self {
            timestamp: r.timestamp,
            label: r.label,
            confidence: r.confidence,
            bullish: r.probabilities.bullish,
            neutral: r.probabilities.neutral,
            bearish: r.probabilities.bearish,
            forecast_return: r.forecast_return,
            forecast_volatility: r.forecast_volatility,
            ci_lower: r.ci_lower,
            ci_upper: r.ci_upper,
            model_agreement: r.model_agreement,
            n_models: r.n_models,
            calibrated: r.calibrated,
            uncertainty: r.uncertainty,
            regime: r.regime,
            error: r.aggregation_error.clone(),
        }
    }
}

pub struct EnsembleManager {
    config: Config,
    models: Vec<Box<dyn ForecastModel>>,
    trained: BTreeSet<String>,
    weights: WeightVector,
    weight_history: Vec<WeightSnapshot>,
    forecast_history: Vec<ForecastResult>,
    /// Uncalibrated ensemble interval per forecast, aligned with `forecast_history`
    raw_intervals: Vec<Option<(f64, f64)>>,
    error_log: Vec<ErrorRecord>,
    quantifier: UncertaintyQuantifier,
    optimizer: WeightOptimizer,
    adaptive: AdaptiveWeightOptimizer,
    regime_detector: RegimeDetector,
}

impl std::fmt::Debug for EnsembleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsembleManager")
            .field("models", &self.models)
            .field("trained", &self.trained)
            .field("weights", &self.weights)
            .field("forecasts", &self.forecast_history.len())
            .field("errors", &self.error_log.len())
            .finish()
    }
}

impl EnsembleManager {
    pub fn new(config: Config) -> Self {
        Self {
            quantifier: UncertaintyQuantifier::new(config.uncertainty.clone()),
            optimizer: WeightOptimizer::new(config.weights.clone()),
            adaptive: AdaptiveWeightOptimizer::new(config.weights.clone()),
            regime_detector: RegimeDetector::new(config.regime.clone()),
            config,
            models: Vec::new(),
            trained: BTreeSet::new(),
            weights: WeightVector::default(),
            weight_history: Vec::new(),
            forecast_history: Vec::new(),
            raw_intervals: Vec::new(),
            error_log: Vec::new(),
        }
    }

    /// Register a model. Names must be unique.
    pub fn add_model(&mut self, model: Box<dyn ForecastModel>) -> Result<()> {
        let name = model.name().to_string();
        if self.models.iter().any(|m| m.name() == name) {
            let err = ForecastError::Configuration(format!("model '{}' is already registered", name));
            self.log_error("add_model", Some(&name), &err);
            return Err(err);
        }
        if !self.is_enabled(model.kind()) {
            tracing::info!("Model {} registered but {:?} is disabled", name, model.kind());
        }
        self.models.push(model);
        Ok(())
    }

    pub fn with_model(mut self, model: Box<dyn ForecastModel>) -> Result<Self> {
        self.add_model(model)?;
        Ok(self)
    }

    pub fn is_enabled(&self, kind: ModelKind) -> bool {
        self.config.ensemble.enabled_models.contains(&kind)
    }

    /// Enable or disable a model family. Disabling drops its models from the
    /// trained set; re-enabled models need another `train`.
    pub fn set_enabled(&mut self, kind: ModelKind, enabled: bool) {
        let list = &mut self.config.ensemble.enabled_models;
        if enabled {
            if !list.contains(&kind) {
                list.push(kind);
            }
            return;
        }
        list.retain(|k| *k != kind);

        let dropped: Vec<String> = self
            .models
            .iter()
            .filter(|m| m.kind() == kind)
            .map(|m| m.name().to_string())
            .collect();
        let before = self.trained.len();
        for name in &dropped {
            self.trained.remove(name);
        }
        if self.trained.len() != before {
            self.reset_weights(format!("{:?} disabled", kind));
        }
    }

    /// Train every enabled model, returning model -> success
    pub fn train(&mut self, frame: &MarketFrame) -> Result<BTreeMap<String, bool>> {
        if let Err(e) = frame.validate() {
            self.log_error("train", None, &e);
            return Err(e);
        }

        let mut outcome = BTreeMap::new();
        let mut failures = Vec::new();
        let enabled = self.config.ensemble.enabled_models.clone();

        for model in self.models.iter_mut() {
            if !enabled.contains(&model.kind()) {
                tracing::debug!("Skipping disabled model {}", model.name());
                continue;
            }
            let name = model.name().to_string();
            match model.train(frame) {
                Ok(()) => {
                    tracing::debug!("Trained {}", name);
                    outcome.insert(name, true);
                }
                Err(e) => {
                    tracing::warn!("Model {} failed to train: {}", name, e);
                    failures.push((name.clone(), e));
                    outcome.insert(name, false);
                }
            }
        }
        for (name, e) in failures {
            self.log_error("train", Some(name.as_str()), &e);
        }

        let now_trained: BTreeSet<String> = outcome
            .iter()
            .filter(|(_, ok)| **ok)
            .map(|(name, _)| name.clone())
            .collect();

        if now_trained.is_empty() {
            let e = ForecastError::AggregationFailure(format!(
                "all {} enabled models failed to train",
                outcome.len()
            ));
            tracing::error!("{}", e);
            self.log_error("train", None, &e);
        }

        if now_trained != self.trained {
            self.trained = now_trained;
            self.adaptive = AdaptiveWeightOptimizer::new(self.config.weights.clone());
            self.reset_weights("trained model set changed".to_string());
        }

        tracing::info!(
            "Training finished: {}/{} models ready",
            self.trained.len(),
            outcome.len()
        );
        Ok(outcome)
    }

    pub fn is_trained(&self) -> bool {
        !self.trained.is_empty()
    }

    pub fn trained_models(&self) -> Vec<String> {
        self.trained.iter().cloned().collect()
    }

    /// Forecast the horizon after the last row of `frame`.
    ///
    /// `regime` selects a regime weight vector when regime-aware weighting is
    /// on; `None` detects it from the frame in that mode.
    pub fn predict(
        &mut self,
        frame: &MarketFrame,
        regime: Option<MarketRegime>,
    ) -> Result<ForecastResult> {
        if !self.is_trained() {
            let e = ForecastError::NotTrained;
            self.log_error("predict", None, &e);
            return Err(e);
        }

        let regime = match regime {
            Some(r) => Some(r),
            None if self.config.ensemble.regime_aware => {
                Some(self.regime_detector.detect(&frame.bars).regime)
            }
            None => None,
        };

        let (components, failures) = self.collect_forecasts(frame);
        for (name, e) in &failures {
            tracing::warn!("Model {} failed to predict: {}", name, e);
            self.log_error("predict", Some(name.as_str()), e);
        }

        let timestamp = Utc::now();
        if components.is_empty() {
            let e = ForecastError::AggregationFailure(format!(
                "all {} trained models failed to predict",
                failures.len()
            ));
            self.log_error("predict", None, &e);
            let mut result = ForecastResult::null(timestamp, e.to_string());
            result.regime = regime;
            self.forecast_history.push(result.clone());
            self.raw_intervals.push(None);
            return Ok(result);
        }

        let weights = self.weights_for(regime);
        let forecasts: Vec<ModelForecast> = components.values().cloned().collect();

        let raw = self.quantifier.aggregate_forecasts(&forecasts, &weights);
        let value = self
            .quantifier
            .apply_calibration(&raw, &self.config.ensemble.calibration_key);
        let probs = self.quantifier.aggregate_probabilities(&forecasts, &weights);

        let names: Vec<&str> = forecasts.iter().map(|f| f.model.as_str()).collect();
        let used = weights.restricted_to(&names);

        let result = match probs {
            Some(p) => ForecastResult {
                timestamp,
                label: p.label,
                confidence: p.confidence,
                probabilities: p.probabilities,
                forecast_return: value.forecast_value,
                forecast_volatility: value.forecast_volatility,
                ci_lower: value.ci_lower,
                ci_upper: value.ci_upper,
                model_agreement: agreement(&value, p.agreement),
                n_models: forecasts.len(),
                weights: used,
                components,
                calibrated: value.calibrated,
                uncertainty: p.uncertainty,
                regime,
                aggregation_error: None,
            },
            None => ForecastResult::null(timestamp, "no forecasts to aggregate"),
        };

        self.raw_intervals.push(raw.ci_lower.zip(raw.ci_upper));
        self.forecast_history.push(result.clone());
        Ok(result)
    }

    fn weights_for(&self, regime: Option<MarketRegime>) -> WeightVector {
        if self.config.ensemble.regime_aware {
            if let Some(w) = self.adaptive.weights_for(regime) {
                return w.clone();
            }
        }
        self.weights.clone()
    }

    /// Run every trained, enabled model; failures come back separately
    fn collect_forecasts(
        &self,
        frame: &MarketFrame,
    ) -> (BTreeMap<String, ModelForecast>, Vec<(String, ForecastError)>) {
        let mut components = BTreeMap::new();
        let mut failures = Vec::new();

        for model in self.active_models() {
            let name = model.name();
            let output = model
                .predict(frame)
                .and_then(|out| out.validate(name).map(|_| out));
            match output {
                Ok(out) => {
                    components.insert(name.to_string(), ModelForecast::from_output(name, out));
                }
                Err(e) => failures.push((name.to_string(), e)),
            }
        }
        (components, failures)
    }

    fn active_models(&self) -> impl Iterator<Item = &Box<dyn ForecastModel>> {
        self.models.iter().filter(|m| {
            self.trained.contains(m.name()) && self.is_enabled(m.kind())
        })
    }

    /// Replay the trailing `optimization_window` rows and learn new weights.
    ///
    /// Row `i` is predicted from rows `..=i` with realized outcomes hidden and
    /// scored against `labels[i]`. New weights only affect later predictions.
    pub fn optimize_weights(
        &mut self,
        frame: &MarketFrame,
        method: Option<OptimizationMethod>,
    ) -> Result<WeightUpdate> {
        let method = method.unwrap_or(self.config.ensemble.optimization_method);
        if !self.is_trained() {
            let e = ForecastError::NotTrained;
            self.log_error("optimize_weights", None, &e);
            return Err(e);
        }
        if let Err(e) = frame.validate() {
            self.log_error("optimize_weights", None, &e);
            return Err(e);
        }
        if !frame.has_labels() {
            let e = ForecastError::insufficient("weight optimization labels", 1, 0);
            self.log_error("optimize_weights", None, &e);
            return Ok(self.skipped_update(method, 0, e));
        }

        let n = frame.len();
        let start = n.saturating_sub(self.config.ensemble.optimization_window);
        let names: Vec<String> = self.active_models().map(|m| m.name().to_string()).collect();

        let mut predictions: BTreeMap<String, Vec<f64>> =
            names.iter().map(|name| (name.clone(), Vec::new())).collect();
        let mut failures: BTreeMap<String, (usize, String)> = BTreeMap::new();
        let mut actuals = Vec::with_capacity(n - start);

        for i in start..n {
            let mut view = frame.head(i + 1);
            view.labels.clear();
            view.returns.clear();

            for model in self.active_models() {
                let value = match model.predict(&view) {
                    Ok(out) => out.label.signed(),
                    Err(e) => {
                        let entry = failures.entry(model.name().to_string()).or_insert((0, String::new()));
                        entry.0 += 1;
                        entry.1 = e.to_string();
                        f64::NAN
                    }
                };
                if let Some(series) = predictions.get_mut(model.name()) {
                    series.push(value);
                }
            }
            actuals.push(frame.labels[i].signed());
        }

        for (name, (count, last)) in failures {
            let e = ForecastError::model_failure(
                &name,
                "optimize_weights",
                format!("{} replay predictions failed, last: {}", count, last),
            );
            self.log_error("optimize_weights", Some(name.as_str()), &e);
        }

        let n_samples = actuals.len();
        let fitted = if self.config.ensemble.regime_aware {
            let regimes = self.regime_detector.label_series(&frame.bars);
            let regimes = &regimes[start..n];
            self.adaptive.fit(&predictions, &actuals, regimes, method)
        } else {
            self.optimizer.optimize_weights(&predictions, &actuals, method)
        };

        match fitted {
            Ok(weights) => {
                tracing::info!(
                    "Installed {} weights from {} replayed rows: {:?}",
                    method,
                    n_samples,
                    weights.as_map()
                );
                self.install_weights(weights.clone(), Some(method), "optimize_weights".to_string());
                Ok(WeightUpdate {
                    weights,
                    applied: true,
                    method,
                    n_samples,
                    reason: None,
                })
            }
            Err(e @ ForecastError::InsufficientData { .. }) => {
                tracing::warn!("Keeping current weights: {}", e);
                self.log_error("optimize_weights", None, &e);
                Ok(self.skipped_update(method, n_samples, e))
            }
            Err(e) => {
                self.log_error("optimize_weights", None, &e);
                Err(e)
            }
        }
    }

    fn skipped_update(
        &self,
        method: OptimizationMethod,
        n_samples: usize,
        reason: ForecastError,
    ) -> WeightUpdate {
        WeightUpdate {
            weights: self.weights.clone(),
            applied: false,
            method,
            n_samples,
            reason: Some(reason.to_string()),
        }
    }

    /// Calibrate the ensemble interval against realized returns.
    ///
    /// `realized_returns[i]` is the outcome of the i-th forecast in history.
    pub fn calibrate_from_history(&mut self, realized_returns: &[f64]) -> CalibrationRecord {
        let n = self.raw_intervals.len().min(realized_returns.len());
        let (lower, upper): (Vec<f64>, Vec<f64>) = self.raw_intervals[..n]
            .iter()
            .map(|ci| ci.unwrap_or((f64::NAN, f64::NAN)))
            .unzip();

        let key = self.config.ensemble.calibration_key.clone();
        let record = self
            .quantifier
            .calibrate_uncertainty(&lower, &upper, &realized_returns[..n], &key);
        if let Some(err) = &record.error {
            self.error_log
                .push(ErrorRecord::new("calibrate_from_history", None, err));
        }
        record
    }

    /// Replace the live weights, e.g. from an external optimizer
    pub fn set_weights(&mut self, weights: WeightVector) -> Result<()> {
        if !weights.is_normalized(1e-6) {
            let err = ForecastError::Configuration(
                "weights must be non-negative and sum to 1".to_string(),
            );
            self.log_error("set_weights", None, &err);
            return Err(err);
        }
        self.install_weights(weights, None, "manual".to_string());
        Ok(())
    }

    fn reset_weights(&mut self, reason: String) {
        let names: Vec<String> = self.trained.iter().cloned().collect();
        self.install_weights(WeightVector::equal(&names), None, reason);
    }

    fn install_weights(
        &mut self,
        weights: WeightVector,
        method: Option<OptimizationMethod>,
        reason: String,
    ) {
        self.weight_history.push(WeightSnapshot {
            timestamp: Utc::now(),
            weights: weights.clone(),
            method,
            reason,
        });
        self.weights = weights;
    }

    fn log_error(&mut self, operation: &str, model: Option<&str>, error: &ForecastError) {
        self.error_log.push(ErrorRecord::new(operation, model, error));
    }

    pub fn detect_regime(&self, frame: &MarketFrame) -> MarketRegime {
        self.regime_detector.detect(&frame.bars).regime
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    pub fn weight_history(&self) -> &[WeightSnapshot] {
        &self.weight_history
    }

    pub fn forecast_history(&self) -> &[ForecastResult] {
        &self.forecast_history
    }

    pub fn error_log(&self) -> &[ErrorRecord] {
        &self.error_log
    }

    pub fn quantifier(&self) -> &UncertaintyQuantifier {
        &self.quantifier
    }

    pub fn quantifier_mut(&mut self) -> &mut UncertaintyQuantifier {
        &mut self.quantifier
    }

    pub fn adaptive(&self) -> &AdaptiveWeightOptimizer {
        &self.adaptive
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn forecast_rows(&self) -> Vec<ForecastRow> {
        self.forecast_history.iter().map(ForecastRow::from).collect()
    }

    pub fn error_rows(&self) -> Vec<ErrorRecord> {
        self.error_log.clone()
    }

    /// Config plus live state, as JSON
    pub fn config_snapshot(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "config": self.config.to_json()?,
            "models": self
                .models
                .iter()
                .map(|m| serde_json::json!({
                    "name": m.name(),
                    "kind": m.kind(),
                    "enabled": self.is_enabled(m.kind()),
                    "trained": self.trained.contains(m.name()),
                }))
                .collect::<Vec<_>>(),
            "weights": serde_json::to_value(&self.weights)?,
            "calibration_ratios": serde_json::to_value(self.quantifier.calibration_ratios())?,
            "forecasts": self.forecast_history.len(),
            "errors": self.error_log.len(),
        }))
    }
}

/// Value-space agreement when the models reported values, else label agreement
fn agreement(value: &EnsembleForecast, label_agreement: f64) -> f64 {
    if value.is_null() {
        label_agreement
    } else {
        value.model_agreement
    }
}
