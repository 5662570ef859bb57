//! Combination weight learning
//!
//! Inputs are per-model signed-direction predictions (+1 / 0 / -1, or any
//! real-valued view) against realized signed outcomes. Every vector returned
//! here is non-negative and sums to one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::WeightOptimizerConfig;
use crate::error::{ForecastError, Result};
use crate::regime::MarketRegime;
use crate::stats;
use crate::types::{Direction, WeightVector};

/// How raw weights are derived from the prediction history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    /// Least squares with w >= 0
    #[default]
    Nnls,
    /// w proportional to 1 / MSE
    InverseError,
    /// w proportional to hit rate above chance
    Accuracy,
    Equal,
}

impl OptimizationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMethod::Nnls => "nnls",
            OptimizationMethod::InverseError => "inverse_error",
            OptimizationMethod::Accuracy => "accuracy",
            OptimizationMethod::Equal => "equal",
        }
    }
}

impl std::fmt::Display for OptimizationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OptimizationMethod {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nnls" => Ok(OptimizationMethod::Nnls),
            "inverse_error" | "inverse-error" => Ok(OptimizationMethod::InverseError),
            "accuracy" => Ok(OptimizationMethod::Accuracy),
            "equal" => Ok(OptimizationMethod::Equal),
            other => Err(ForecastError::Configuration(format!(
                "unknown optimization method '{}'",
                other
            ))),
        }
    }
}

/// Chance level for a three-class direction forecast
const CHANCE_ACCURACY: f64 = 1.0 / 3.0;
const MSE_FLOOR: f64 = 1e-9;

/// Design matrix after alignment: one column per eligible model
struct Aligned {
    models: Vec<String>,
    columns: Vec<Vec<f64>>,
    target: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct WeightOptimizer {
    config: WeightOptimizerConfig,
}

impl WeightOptimizer {
    pub fn new(config: WeightOptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WeightOptimizerConfig {
        &self.config
    }

    /// Learn a weight vector over every model in `predictions`.
    ///
    /// Models with fewer than `min_samples` finite values in the right-aligned
    /// common span come back with weight 0. Fails with `InsufficientData` when no model is eligible.
    pub fn optimize_weights(
        &self,
        predictions: &BTreeMap<String, Vec<f64>>,
        actuals: &[f64],
        method: OptimizationMethod,
    ) -> Result<WeightVector> {
        let all_models: Vec<String> = predictions.keys().cloned().collect();
        let aligned = self.align(predictions, actuals)?;

        let raw = match method {
            OptimizationMethod::Nnls => self.nnls(&aligned),
            OptimizationMethod::InverseError => inverse_error(&aligned),
            OptimizationMethod::Accuracy => hit_rate_excess(&aligned),
            OptimizationMethod::Equal => vec![1.0; aligned.models.len()],
        };

        let raw_map: BTreeMap<String, f64> = aligned.models.iter().cloned().zip(raw).collect();
        let weights = WeightVector::from_raw(raw_map).with_zeros(&all_models);

        tracing::debug!(
            "Optimized weights via {} over {} rows: {:?}",
            method,
            aligned.target.len(),
            weights.as_map()
        );
        Ok(weights)
    }

    fn align(&self, predictions: &BTreeMap<String, Vec<f64>>, actuals: &[f64]) -> Result<Aligned> {
        let min_samples = self.config.min_samples;

        // Shortest span shared by the actuals and every model long enough to qualify
        let common = predictions
            .values()
            .map(Vec::len)
            .filter(|&len| len >= min_samples)
            .min()
            .unwrap_or(0)
            .min(actuals.len());

        let mut eligible = Vec::new();
        let mut best_count = 0;
        for (model, values) in predictions {
            let usable = stats::tail(values, common)
                .iter()
                .filter(|v| v.is_finite())
                .count();
            best_count = best_count.max(usable);
            if values.len() >= min_samples && usable >= min_samples {
                eligible.push(model.clone());
            } else {
                tracing::debug!(
                    "Excluding {} from weight optimization: {} usable samples in the last {} rows",
                    model,
                    usable,
                    common
                );
            }
        }
        if eligible.is_empty() {
            return Err(ForecastError::insufficient(
                "weight optimization",
                min_samples,
                best_count,
            ));
        }

        let target_tail = stats::tail(actuals, common);
        let tails: Vec<&[f64]> = eligible
            .iter()
            .map(|m| stats::tail(&predictions[m], common))
            .collect();

        let rows: Vec<usize> = (0..common).filter(|&i| target_tail[i].is_finite()).collect();
        if rows.len() < min_samples {
            return Err(ForecastError::insufficient(
                "weight optimization",
                min_samples,
                rows.len(),
            ));
        }

        let columns = tails
            .iter()
            .map(|col| {
                rows.iter()
                    .map(|&i| if col[i].is_finite() { col[i] } else { 0.0 })
                    .collect()
            })
            .collect();
        let target = rows.iter().map(|&i| target_tail[i]).collect();

        Ok(Aligned {
            models: eligible,
            columns,
            target,
        })
    }

    /// Cyclic coordinate descent on 0.5 * ||Xw - y||^2 with w >= 0
    fn nnls(&self, data: &Aligned) -> Vec<f64> {
        let m = data.columns.len();
        let mut w = vec![0.0; m];
        let mut residual: Vec<f64> = data.target.clone();
        let norms: Vec<f64> = data
            .columns
            .iter()
            .map(|col| col.iter().map(|x| x * x).sum())
            .collect();

        for iteration in 0..self.config.max_iterations {
            let mut max_step: f64 = 0.0;
            for j in 0..m {
                let updated = if norms[j] <= f64::EPSILON {
                    0.0
                } else {
                    let grad: f64 = data.columns[j]
                        .iter()
                        .zip(&residual)
                        .map(|(x, r)| x * r)
                        .sum();
                    (w[j] + grad / norms[j]).max(0.0)
                };
                let step = updated - w[j];
                if step != 0.0 {
                    for (r, x) in residual.iter_mut().zip(&data.columns[j]) {
                        *r -= step * x;
                    }
                    w[j] = updated;
                    max_step = max_step.max(step.abs());
                }
            }
            if max_step < self.config.tolerance {
                tracing::trace!("NNLS converged after {} iterations", iteration + 1);
                break;
            }
        }
        w
    }
}

fn inverse_error(data: &Aligned) -> Vec<f64> {
    data.columns
        .iter()
        .map(|col| {
            let mse = stats::rmse(col, &data.target).map(|r| r * r).unwrap_or(f64::INFINITY);
            1.0 / mse.max(MSE_FLOOR)
        })
        .collect()
}

fn hit_rate_excess(data: &Aligned) -> Vec<f64> {
    let n = data.target.len() as f64;
    data.columns
        .iter()
        .map(|col| {
            let hits = col
                .iter()
                .zip(&data.target)
                .filter(|(p, a)| Direction::from_signed(**p) == Direction::from_signed(**a))
                .count() as f64;
            (hits / n - CHANCE_ACCURACY).max(0.0)
        })
        .collect()
}

/// One weight vector per market regime plus a global fallback
#[derive(Debug, Clone, Default)]
pub struct AdaptiveWeightOptimizer {
    optimizer: WeightOptimizer,
    global: Option<WeightVector>,
    by_regime: BTreeMap<MarketRegime, WeightVector>,
}

impl AdaptiveWeightOptimizer {
    pub fn new(config: WeightOptimizerConfig) -> Self {
        Self {
            optimizer: WeightOptimizer::new(config),
            global: None,
            by_regime: BTreeMap::new(),
        }
    }

    /// Fit the global vector and every regime with enough samples.
    ///
    /// `regimes[i]` labels `actuals[i]`; prediction arrays are right-aligned
    /// against them. Returns the global vector. Previously fitted regime
    /// vectors are replaced.
    pub fn fit(
        &mut self,
        predictions: &BTreeMap<String, Vec<f64>>,
        actuals: &[f64],
        regimes: &[MarketRegime],
        method: OptimizationMethod,
    ) -> Result<WeightVector> {
        let n = actuals.len().min(regimes.len());
        let actuals = stats::tail(actuals, n);
        let regimes = stats::tail(regimes, n);

        // Pad short histories with NaN so every row index lines up
        let padded: BTreeMap<String, Vec<f64>> = predictions
            .iter()
            .map(|(model, values)| {
                let tail = stats::tail(values, n);
                let mut row = vec![f64::NAN; n - tail.len()];
                row.extend_from_slice(tail);
                (model.clone(), row)
            })
            .collect();

        let global = self.optimizer.optimize_weights(&padded, actuals, method)?;

        let min_regime = self.optimizer.config().min_regime_samples;
        let mut by_regime = BTreeMap::new();
        let mut seen: Vec<MarketRegime> = regimes.to_vec();
        seen.sort();
        seen.dedup();

        for regime in seen {
            let rows: Vec<usize> = (0..n).filter(|&i| regimes[i] == regime).collect();
            if rows.len() < min_regime {
                tracing::debug!(
                    "Regime {} has {} samples (< {}), using global weights",
                    regime,
                    rows.len(),
                    min_regime
                );
                continue;
            }
            let sub_predictions: BTreeMap<String, Vec<f64>> = padded
                .iter()
                .map(|(model, values)| (model.clone(), rows.iter().map(|&i| values[i]).collect()))
                .collect();
            let sub_actuals: Vec<f64> = rows.iter().map(|&i| actuals[i]).collect();

            match self.optimizer.optimize_weights(&sub_predictions, &sub_actuals, method) {
                Ok(weights) => {
                    by_regime.insert(regime, weights);
                }
                Err(e) => tracing::debug!("No weights for regime {}: {}", regime, e),
            }
        }

        tracing::info!(
            "Adaptive weights fitted: global + {} regime vectors",
            by_regime.len()
        );
        self.global = Some(global.clone());
        self.by_regime = by_regime;
        Ok(global)
    }

    /// Regime vector when one was fitted, otherwise the global vector
    pub fn weights_for(&self, regime: Option<MarketRegime>) -> Option<&WeightVector> {
        regime
            .and_then(|r| self.by_regime.get(&r))
            .or(self.global.as_ref())
    }

    pub fn global(&self) -> Option<&WeightVector> {
        self.global.as_ref()
    }

    pub fn fitted_regimes(&self) -> Vec<MarketRegime> {
        self.by_regime.keys().copied().collect()
    }

    pub fn is_fitted(&self) -> bool {
        self.global.is_some()
    }
}
