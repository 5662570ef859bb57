//! Core data types shared by the ensemble, validation and monitoring layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ForecastError, Result};
use crate::regime::MarketRegime;

/// Tolerance used when checking that probabilities sum to one
pub const PROBABILITY_TOLERANCE: f64 = 1e-3;

/// Directional outcome over the forecast horizon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Bearish,
    Neutral,
    Bullish,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Bullish, Direction::Neutral, Direction::Bearish];

    /// Signed value: +1 bullish, 0 neutral, -1 bearish
    pub fn signed(&self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Neutral => 0.0,
            Direction::Bearish => -1.0,
        }
    }

    /// Map a signed value back to a direction (sign only)
    pub fn from_signed(value: f64) -> Self {
        if value > 0.0 {
            Direction::Bullish
        } else if value < 0.0 {
            Direction::Bearish
        } else {
            Direction::Neutral
        }
    }

    /// Classify a realized return, treating |r| <= band as neutral
    pub fn from_return(ret: f64, neutral_band: f64) -> Self {
        if ret > neutral_band {
            Direction::Bullish
        } else if ret < -neutral_band {
            Direction::Bearish
        } else {
            Direction::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Neutral => "neutral",
            Direction::Bearish => "bearish",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probability per direction class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassProbabilities {
    pub bullish: f64,
    pub neutral: f64,
    pub bearish: f64,
}

impl ClassProbabilities {
    pub fn new(bullish: f64, neutral: f64, bearish: f64) -> Self {
        Self {
            bullish,
            neutral,
            bearish,
        }
    }

    pub fn uniform() -> Self {
        Self::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0)
    }

    /// All mass on one class
    pub fn certain(direction: Direction) -> Self {
        let mut p = Self::new(0.0, 0.0, 0.0);
        p.set(direction, 1.0);
        p
    }

    pub fn get(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Bullish => self.bullish,
            Direction::Neutral => self.neutral,
            Direction::Bearish => self.bearish,
        }
    }

    pub fn set(&mut self, direction: Direction, value: f64) {
        match direction {
            Direction::Bullish => self.bullish = value,
            Direction::Neutral => self.neutral = value,
            Direction::Bearish => self.bearish = value,
        }
    }

    pub fn sum(&self) -> f64 {
        self.bullish + self.neutral + self.bearish
    }

    /// Rescale to sum to one; degenerate input becomes uniform
    pub fn normalized(&self) -> Self {
        let clean = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        let p = Self::new(clean(self.bullish), clean(self.neutral), clean(self.bearish));
        let total = p.sum();
        if total <= f64::EPSILON {
            return Self::uniform();
        }
        Self::new(p.bullish / total, p.neutral / total, p.bearish / total)
    }

    /// Most likely class; ties resolve bullish, then neutral, then bearish
    pub fn argmax(&self) -> Direction {
        let mut best = Direction::Bullish;
        for dir in Direction::ALL {
            if self.get(dir) > self.get(best) {
                best = dir;
            }
        }
        best
    }

    pub fn max(&self) -> f64 {
        self.get(self.argmax())
    }

    /// Shannon entropy divided by ln(3), so 0 = certain and 1 = uniform
    pub fn normalized_entropy(&self) -> f64 {
        let entropy: f64 = Direction::ALL
            .iter()
            .map(|d| self.get(*d))
            .filter(|p| *p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        (entropy / 3f64.ln()).clamp(0.0, 1.0)
    }

    pub fn is_valid(&self) -> bool {
        let values = [self.bullish, self.neutral, self.bearish];
        values.iter().all(|v| v.is_finite() && *v >= 0.0)
            && (self.sum() - 1.0).abs() <= PROBABILITY_TOLERANCE
    }
}

impl Default for ClassProbabilities {
    fn default() -> Self {
        Self::uniform()
    }
}

/// What a model hands back from `predict`.
///
/// `label`, `confidence` and `probabilities` are required; the remaining
/// fields are optional and treated as absent when `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub label: Direction,
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
    #[serde(default)]
    pub forecast_return: Option<f64>,
    #[serde(default)]
    pub forecast_volatility: Option<f64>,
    #[serde(default)]
    pub ci_lower: Option<f64>,
    #[serde(default)]
    pub ci_upper: Option<f64>,
}

impl ModelOutput {
    /// Directional-only output, no return forecast
    pub fn directional(probabilities: ClassProbabilities) -> Self {
        let probabilities = probabilities.normalized();
        Self {
            label: probabilities.argmax(),
            confidence: probabilities.max(),
            probabilities,
            forecast_return: None,
            forecast_volatility: None,
            ci_lower: None,
            ci_upper: None,
        }
    }

    pub fn with_return(mut self, forecast_return: f64, volatility: f64) -> Self {
        self.forecast_return = Some(forecast_return);
        self.forecast_volatility = Some(volatility);
        self
    }

    pub fn with_interval(mut self, lower: f64, upper: f64) -> Self {
        self.ci_lower = Some(lower);
        self.ci_upper = Some(upper);
        self
    }

    /// Check the output contract for a named model
    pub fn validate(&self, model: &str) -> Result<()> {
        let invalid = |reason: String| ForecastError::InvalidOutput {
            model: model.to_string(),
            reason,
        };

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(invalid(format!("confidence {} outside [0, 1]", self.confidence)));
        }
        if !self.probabilities.is_valid() {
            return Err(invalid(format!(
                "probabilities must be non-negative and sum to 1 (sum = {:.4})",
                self.probabilities.sum()
            )));
        }
        let optionals = [
            ("forecast_return", self.forecast_return),
            ("forecast_volatility", self.forecast_volatility),
            ("ci_lower", self.ci_lower),
            ("ci_upper", self.ci_upper),
        ];
        for (field, value) in optionals {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(invalid(format!("{} is not finite", field)));
                }
            }
        }
        if let Some(vol) = self.forecast_volatility {
            if vol < 0.0 {
                return Err(invalid(format!("negative forecast_volatility {}", vol)));
            }
        }
        if let (Some(lo), Some(hi)) = (self.ci_lower, self.ci_upper) {
            if lo > hi {
                return Err(invalid(format!("ci_lower {} above ci_upper {}", lo, hi)));
            }
        }
        Ok(())
    }
}

/// One model's contribution to a single ensemble prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelForecast {
    pub model: String,
    /// Expected return, `None` when the model only forecasts direction
    pub forecast_value: Option<f64>,
    /// Forecast standard deviation (0 when not reported)
    pub forecast_volatility: f64,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub label: Direction,
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
}

impl ModelForecast {
    pub fn from_output(model: &str, output: ModelOutput) -> Self {
        Self {
            model: model.to_string(),
            forecast_value: output.forecast_return,
            forecast_volatility: output.forecast_volatility.unwrap_or(0.0),
            ci_lower: output.ci_lower,
            ci_upper: output.ci_upper,
            label: output.label,
            confidence: output.confidence,
            probabilities: output.probabilities,
        }
    }

    /// Shorthand for value-space forecasts
    pub fn point(model: &str, value: f64, volatility: f64) -> Self {
        Self {
            model: model.to_string(),
            forecast_value: Some(value),
            forecast_volatility: volatility,
            ci_lower: None,
            ci_upper: None,
            label: Direction::from_signed(value),
            confidence: 0.5,
            probabilities: ClassProbabilities::uniform(),
        }
    }

    pub fn interval(&self) -> Option<(f64, f64)> {
        match (self.ci_lower, self.ci_upper) {
            (Some(lo), Some(hi)) if lo.is_finite() && hi.is_finite() => Some((lo, hi)),
            _ => None,
        }
    }
}

/// Single OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Materialized market history handed to the engine.
///
/// `bars` and `features` are row-aligned. `labels[i]` / `returns[i]` hold the
/// realized direction and return over the horizon starting at row `i`; both
/// may be empty for prediction-only frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketFrame {
    pub bars: Vec<OhlcBar>,
    pub features: Vec<Vec<f64>>,
    #[serde(default)]
    pub labels: Vec<Direction>,
    #[serde(default)]
    pub returns: Vec<f64>,
}

impl MarketFrame {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn has_labels(&self) -> bool {
        !self.labels.is_empty() && self.labels.len() == self.bars.len()
    }

    pub fn has_returns(&self) -> bool {
        !self.returns.is_empty() && self.returns.len() == self.bars.len()
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.bars.len();
        if self.features.len() != n {
            return Err(ForecastError::Configuration(format!(
                "feature rows ({}) do not match bars ({})",
                self.features.len(),
                n
            )));
        }
        if !self.labels.is_empty() && self.labels.len() != n {
            return Err(ForecastError::Configuration(format!(
                "labels ({}) do not match bars ({})",
                self.labels.len(),
                n
            )));
        }
        if !self.returns.is_empty() && self.returns.len() != n {
            return Err(ForecastError::Configuration(format!(
                "returns ({}) do not match bars ({})",
                self.returns.len(),
                n
            )));
        }
        Ok(())
    }

    /// Rows `start..end` (end exclusive, clamped to the frame)
    pub fn slice(&self, start: usize, end: usize) -> MarketFrame {
        let end = end.min(self.len());
        let start = start.min(end);
        let pick = |len: usize| if len == self.len() { start..end } else { 0..0 };
        MarketFrame {
            bars: self.bars[start..end].to_vec(),
            features: self.features[start..end].to_vec(),
            labels: self.labels[pick(self.labels.len())].to_vec(),
            returns: self.returns[pick(self.returns.len())].to_vec(),
        }
    }

    /// First `n` rows
    pub fn head(&self, n: usize) -> MarketFrame {
        self.slice(0, n)
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }
}

/// Combination weights keyed by model name.
///
/// Every weight is non-negative and the weights sum to one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightVector(BTreeMap<String, f64>);

impl WeightVector {
    pub fn equal<S: AsRef<str>>(models: &[S]) -> Self {
        if models.is_empty() {
            return Self::default();
        }
        let w = 1.0 / models.len() as f64;
        Self(models.iter().map(|m| (m.as_ref().to_string(), w)).collect())
    }

    /// Clip negative or non-finite entries to zero and renormalize.
    /// All-zero input falls back to equal weights over the given names.
    pub fn from_raw(raw: BTreeMap<String, f64>) -> Self {
        let clipped: BTreeMap<String, f64> = raw
            .into_iter()
            .map(|(k, v)| (k, if v.is_finite() && v > 0.0 { v } else { 0.0 }))
            .collect();
        let total: f64 = clipped.values().sum();
        if total <= f64::EPSILON {
            let names: Vec<String> = clipped.keys().cloned().collect();
            return Self::equal(&names);
        }
        Self(clipped.into_iter().map(|(k, v)| (k, v / total)).collect())
    }

    pub fn get(&self, model: &str) -> f64 {
        self.0.get(model).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.0.contains_key(model)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn models(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    /// Weights restricted to `models`, renormalized over that subset
    pub fn restricted_to<S: AsRef<str>>(&self, models: &[S]) -> Self {
        let raw = models
            .iter()
            .map(|m| (m.as_ref().to_string(), self.get(m.as_ref())))
            .collect();
        Self::from_raw(raw)
    }

    /// Add zero-weight entries for `models` not already present
    pub fn with_zeros<S: AsRef<str>>(mut self, models: &[S]) -> Self {
        for m in models {
            self.0.entry(m.as_ref().to_string()).or_insert(0.0);
        }
        self
    }

    /// Non-negative and summing to one within `tolerance`
    pub fn is_normalized(&self, tolerance: f64) -> bool {
        !self.0.is_empty()
            && self.0.values().all(|w| w.is_finite() && *w >= 0.0)
            && (self.sum() - 1.0).abs() <= tolerance
    }
}

/// Output of one `EnsembleManager::predict` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub timestamp: DateTime<Utc>,
    pub label: Direction,
    pub confidence: f64,
    pub probabilities: ClassProbabilities,
    pub forecast_return: Option<f64>,
    pub forecast_volatility: Option<f64>,
    pub ci_lower: Option<f64>,
    pub ci_upper: Option<f64>,
    pub model_agreement: f64,
    pub n_models: usize,
    pub weights: WeightVector,
    pub components: BTreeMap<String, ModelForecast>,
    pub calibrated: bool,
    /// Normalized entropy of the aggregated class probabilities
    pub uncertainty: f64,
    pub regime: Option<MarketRegime>,
    /// Set when no model produced a usable forecast
    pub aggregation_error: Option<String>,
}

impl ForecastResult {
    pub fn is_null(&self) -> bool {
        self.aggregation_error.is_some()
    }

    /// Explicit empty result when every model failed
    pub fn null(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            timestamp,
            label: Direction::Neutral,
            confidence: 0.0,
            probabilities: ClassProbabilities::uniform(),
            forecast_return: None,
            forecast_volatility: None,
            ci_lower: None,
            ci_upper: None,
            model_agreement: 0.0,
            n_models: 0,
            weights: WeightVector::default(),
            components: BTreeMap::new(),
            calibrated: false,
            uncertainty: 1.0,
            regime: None,
            aggregation_error: Some(error.into()),
        }
    }

    /// Per-model predicted directions
    pub fn component_labels(&self) -> BTreeMap<String, Direction> {
        self.components
            .iter()
            .map(|(name, f)| (name.clone(), f.label))
            .collect()
    }
}

/// Logged failure from any public operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub model: Option<String>,
    pub error: String,
}

impl ErrorRecord {
    pub fn new(operation: &str, model: Option<&str>, error: impl ToString) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            model: model.map(|m| m.to_string()),
            error: error.to_string(),
        }
    }
}
