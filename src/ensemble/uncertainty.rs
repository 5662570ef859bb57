//! Uncertainty aggregation and interval calibration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::UncertaintyConfig;
use crate::stats;
use crate::types::{ClassProbabilities, Direction, ModelForecast, WeightVector};

/// Value-space ensemble forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleForecast {
    pub forecast_value: Option<f64>,
    pub forecast_volatility: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub model_agreement: f64,
    /// Models with a finite value that took part
    pub n_models: usize,
    /// Weights actually used, renormalized over participants
    pub weights: WeightVector,
    pub calibrated: bool,
    pub calibration_ratio: Option<f64>,
    pub error: Option<String>,
}

impl EnsembleForecast {
    pub fn null(error: impl Into<String>) -> Self {
        Self {
            forecast_value: None,
            forecast_volatility: None,
            ci_lower: None,
            ci_upper: None,
            model_agreement: 0.0,
            n_models: 0,
            weights: WeightVector::default(),
            calibrated: false,
            calibration_ratio: None,
            error: Some(error.into()),
        }
    }

    pub fn is_null(&self) -> bool {
        self.forecast_value.is_none()
    }
}

/// Outcome of one interval calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub model: String,
    /// `None` when there were too few samples to measure
    pub empirical_coverage: Option<f64>,
    pub target_coverage: f64,
    pub calibration_ratio: f64,
    pub n_samples: usize,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

impl CalibrationRecord {
    pub fn is_sentinel(&self) -> bool {
        self.error.is_some()
    }
}

/// Probability-space ensemble forecast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityAggregate {
    pub label: Direction,
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
    /// Normalized entropy, 0 = certain, 1 = uniform
    pub uncertainty: f64,
    /// Weight share of models whose own label matches `label`
    pub agreement: f64,
    pub n_models: usize,
}

/// Combines model forecasts into one interval and keeps per-model
/// calibration ratios.
#[derive(Debug, Clone)]
pub struct UncertaintyQuantifier {
    config: UncertaintyConfig,
    z: f64,
    ratios: BTreeMap<String, f64>,
    history: Vec<CalibrationRecord>,
}

impl UncertaintyQuantifier {
    pub fn new(config: UncertaintyConfig) -> Self {
        let z = stats::z_for_confidence(config.confidence_level);
        Self {
            config,
            z,
            ratios: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    pub fn z_score(&self) -> f64 {
        self.z
    }

    pub fn confidence_level(&self) -> f64 {
        self.config.confidence_level
    }

    /// Weighted mean with a variance that adds model disagreement to the
    /// weighted model variances. Never fails: no usable input yields a null
    /// forecast carrying the reason.
    pub fn aggregate_forecasts(
        &self,
        forecasts: &[ModelForecast],
        weights: &WeightVector,
    ) -> EnsembleForecast {
        let usable: Vec<&ModelForecast> = forecasts
            .iter()
            .filter(|f| f.forecast_value.map(f64::is_finite).unwrap_or(false))
            .collect();
        if usable.is_empty() {
            return EnsembleForecast::null(format!(
                "no finite forecast values among {} models",
                forecasts.len()
            ));
        }

        let names: Vec<&str> = usable.iter().map(|f| f.model.as_str()).collect();
        let active = weights.restricted_to(&names);

        let values: Vec<f64> = usable.iter().filter_map(|f| f.forecast_value).collect();
        let mut mean = 0.0;
        let mut model_variance = 0.0;
        for f in &usable {
            let w = active.get(&f.model);
            let sigma = if f.forecast_volatility.is_finite() {
                f.forecast_volatility.max(0.0)
            } else {
                0.0
            };
            mean += w * f.forecast_value.unwrap_or(0.0);
            model_variance += w * sigma * sigma;
        }
        let disagreement = stats::variance(&values).unwrap_or(0.0);
        let volatility = (model_variance + disagreement).sqrt();

        let mut lower = mean - self.z * volatility;
        let mut upper = mean + self.z * volatility;

        let with_interval: Vec<(&str, (f64, f64))> = usable
            .iter()
            .filter_map(|f| f.interval().map(|ci| (f.model.as_str(), ci)))
            .collect();
        if !with_interval.is_empty() {
            let ci_names: Vec<&str> = with_interval.iter().map(|(m, _)| *m).collect();
            let ci_weights = active.restricted_to(&ci_names);
            let (avg_lo, avg_hi) = with_interval.iter().fold((0.0, 0.0), |(lo, hi), (m, ci)| {
                let w = ci_weights.get(m);
                (lo + w * ci.0, hi + w * ci.1)
            });
            lower = lower.min(avg_lo);
            upper = upper.max(avg_hi);
        }

        let spread = disagreement.sqrt();
        let model_agreement = if volatility <= f64::EPSILON {
            1.0
        } else {
            (1.0 - spread / volatility).clamp(0.0, 1.0)
        };

        EnsembleForecast {
            forecast_value: Some(mean),
            forecast_volatility: Some(volatility),
            ci_lower: Some(lower),
            ci_upper: Some(upper),
            model_agreement,
            n_models: usable.len(),
            weights: active,
            calibrated: false,
            calibration_ratio: None,
            error: None,
        }
    }

    /// Measure interval coverage for `model` and store the ratio.
    ///
    /// Below `min_samples_for_calibration` usable rows the returned record is
    /// a sentinel (ratio 1.0 plus an error) and nothing is stored.
    pub fn calibrate_uncertainty(
        &mut self,
        lower: &[f64],
        upper: &[f64],
        actuals: &[f64],
        model: &str,
    ) -> CalibrationRecord {
        let target = self.config.confidence_level;
        let n = lower.len().min(upper.len()).min(actuals.len());
        let rows: Vec<(f64, f64, f64)> = (0..n)
            .map(|i| (lower[i], upper[i], actuals[i]))
            .filter(|(lo, hi, a)| lo.is_finite() && hi.is_finite() && a.is_finite())
            .collect();

        let required = self.config.min_samples_for_calibration;
        if rows.len() < required {
            tracing::debug!(
                "Skipping calibration for {}: {} usable samples (< {})",
                model,
                rows.len(),
                required
            );
            return CalibrationRecord {
                model: model.to_string(),
                empirical_coverage: None,
                target_coverage: target,
                calibration_ratio: 1.0,
                n_samples: rows.len(),
                timestamp: Utc::now(),
                error: Some(format!(
                    "insufficient samples for calibration: need {}, have {}",
                    required,
                    rows.len()
                )),
            };
        }

        let covered = rows
            .iter()
            .filter(|(lo, hi, a)| *a >= *lo && *a <= *hi)
            .count();
        let coverage = covered as f64 / rows.len() as f64;
        let ratio = coverage / target;

        let record = CalibrationRecord {
            model: model.to_string(),
            empirical_coverage: Some(coverage),
            target_coverage: target,
            calibration_ratio: ratio,
            n_samples: rows.len(),
            timestamp: Utc::now(),
            error: None,
        };
        tracing::info!(
            "Calibrated {}: coverage {:.3} vs target {:.3} (ratio {:.3}, n={})",
            model,
            coverage,
            target,
            ratio,
            rows.len()
        );
        self.ratios.insert(model.to_string(), ratio);
        self.history.push(record.clone());
        record
    }

    /// Ratio used for `model`: its own, else the mean over calibrated models
    pub fn ratio_for(&self, model: &str) -> Option<f64> {
        if let Some(r) = self.ratios.get(model) {
            return Some(*r);
        }
        let all: Vec<f64> = self.ratios.values().copied().collect();
        stats::mean(&all)
    }

    /// Rescale volatility and the interval half-widths by sqrt(1 / ratio)
    pub fn apply_calibration(&self, forecast: &EnsembleForecast, model: &str) -> EnsembleForecast {
        let mut out = forecast.clone();
        let Some(ratio) = self.ratio_for(model) else {
            out.calibrated = false;
            return out;
        };
        let Some(mean) = forecast.forecast_value else {
            return out;
        };

        let ratio = ratio.max(self.config.min_calibration_ratio);
        let scale = (1.0 / ratio).sqrt();

        out.forecast_volatility = forecast.forecast_volatility.map(|v| v * scale);
        out.ci_lower = forecast.ci_lower.map(|lo| mean - (mean - lo) * scale);
        out.ci_upper = forecast.ci_upper.map(|hi| mean + (hi - mean) * scale);
        out.calibrated = true;
        out.calibration_ratio = Some(ratio);
        out
    }

    /// Weighted class-probability average, `None` for no forecasts
    pub fn aggregate_probabilities(
        &self,
        forecasts: &[ModelForecast],
        weights: &WeightVector,
    ) -> Option<ProbabilityAggregate> {
        if forecasts.is_empty() {
            return None;
        }
        let names: Vec<&str> = forecasts.iter().map(|f| f.model.as_str()).collect();
        let active = weights.restricted_to(&names);

        let mut combined = ClassProbabilities::new(0.0, 0.0, 0.0);
        for f in forecasts {
            let w = active.get(&f.model);
            let p = f.probabilities.normalized();
            for dir in Direction::ALL {
                combined.set(dir, combined.get(dir) + w * p.get(dir));
            }
        }
        let probabilities = combined.normalized();
        let label = probabilities.argmax();

        let agreement = forecasts
            .iter()
            .filter(|f| f.label == label)
            .map(|f| active.get(&f.model))
            .sum::<f64>()
            .clamp(0.0, 1.0);

        Some(ProbabilityAggregate {
            label,
            confidence: probabilities.max(),
            probabilities,
            uncertainty: probabilities.normalized_entropy(),
            agreement,
            n_models: forecasts.len(),
        })
    }

    pub fn calibration_ratios(&self) -> &BTreeMap<String, f64> {
        &self.ratios
    }

    pub fn calibration_history(&self) -> &[CalibrationRecord] {
        &self.history
    }
}
