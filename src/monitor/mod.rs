//! Performance monitoring and alerting
//!
//! Tracks realized outcomes against ensemble forecasts, computes rolling and
//! per-model accuracy, confidence calibration and raises deduplicated alerts.
//! Alerts are data: they are stored and returned, never raised as errors.

pub mod dashboard;
pub mod health;
#[cfg(test)]
mod tests;

pub use dashboard::{DashboardSummary, PerformanceRow};
pub use health::{HealthStatus, ModelHealth, ModelHealthChecker, WeightTrend};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::ensemble::CalibrationRecord;
use crate::types::{ClassProbabilities, Direction, ForecastResult, WeightVector};

/// Width of each confidence bin
const CONFIDENCE_BIN_WIDTH: f64 = 0.2;
const N_CONFIDENCE_BINS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowAccuracy,
    ModelDegradation,
    AccuracyDrop,
    CalibrationDrift,
    PoorConfidenceCalibration,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::LowAccuracy => "low_accuracy",
            AlertType::ModelDegradation => "model_degradation",
            AlertType::AccuracyDrop => "accuracy_drop",
            AlertType::CalibrationDrift => "calibration_drift",
            AlertType::PoorConfidenceCalibration => "poor_confidence_calibration",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub model: Option<String>,
    pub acknowledged: bool,
}

/// Ground truth for one forecast, as handed to `record_prediction`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionInput {
    pub timestamp: DateTime<Utc>,
    pub prediction: Direction,
    pub actual: Direction,
    pub actual_return: Option<f64>,
    pub confidence: f64,
    pub agreement: f64,
    pub probabilities: ClassProbabilities,
    pub weights: WeightVector,
    /// Direction each model predicted
    pub model_predictions: BTreeMap<String, Direction>,
}

impl PredictionInput {
    /// Input with no per-model detail
    pub fn simple(
        timestamp: DateTime<Utc>,
        prediction: Direction,
        actual: Direction,
        confidence: f64,
    ) -> Self {
        let mut probabilities = ClassProbabilities::uniform();
        probabilities.set(prediction, confidence);
        Self {
            timestamp,
            prediction,
            actual,
            actual_return: None,
            confidence,
            agreement: 1.0,
            probabilities: probabilities.normalized(),
            weights: WeightVector::default(),
            model_predictions: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub prediction: Direction,
    pub actual: Direction,
    pub actual_return: Option<f64>,
    pub confidence: f64,
    pub agreement: f64,
    pub is_correct: bool,
    pub probabilities: ClassProbabilities,
    pub weights: WeightVector,
    pub model_predictions: BTreeMap<String, Direction>,
}

/// Accuracy for records whose realized direction is one class
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassAccuracy {
    pub n: usize,
    pub correct: usize,
    pub accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingAccuracy {
    pub window: usize,
    pub n_samples: usize,
    pub accuracy: f64,
    pub per_class: BTreeMap<Direction, ClassAccuracy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub n: usize,
    pub accuracy: f64,
    pub mean_confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceCalibration {
    /// Non-empty bins only
    pub bins: Vec<CalibrationBin>,
    /// Expected calibration error
    pub ece: f64,
    pub n_samples: usize,
    pub well_calibrated: bool,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    records: Vec<PerformanceRecord>,
    weight_history: Vec<(DateTime<Utc>, WeightVector)>,
    calibration_ratios: BTreeMap<String, f64>,
    alerts: VecDeque<Alert>,
    /// Last time each (type, model) alert fired
    last_fired: HashMap<(AlertType, Option<String>), DateTime<Utc>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            weight_history: Vec::new(),
            calibration_ratios: BTreeMap::new(),
            alerts: VecDeque::new(),
            last_fired: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Store one realized outcome and evaluate alert rules at its timestamp.
    /// Returns the alerts raised by this record.
    pub fn record_prediction(&mut self, input: PredictionInput) -> Vec<Alert> {
        let record = PerformanceRecord {
            timestamp: input.timestamp,
            prediction: input.prediction,
            actual: input.actual,
            actual_return: input.actual_return,
            confidence: input.confidence,
            agreement: input.agreement,
            is_correct: input.prediction == input.actual,
            probabilities: input.probabilities,
            weights: input.weights,
            model_predictions: input.model_predictions,
        };
        if !record.weights.is_empty() {
            self.weight_history
                .push((record.timestamp, record.weights.clone()));
        }
        let timestamp = record.timestamp;
        self.records.push(record);
        self.evaluate_alerts(timestamp)
    }

    /// Record the realized outcome of an ensemble forecast
    pub fn record_forecast(
        &mut self,
        forecast: &ForecastResult,
        actual: Direction,
        actual_return: Option<f64>,
        timestamp: DateTime<Utc>,
    ) -> Vec<Alert> {
        self.record_prediction(PredictionInput {
            timestamp,
            prediction: forecast.label,
            actual,
            actual_return,
            confidence: forecast.confidence,
            agreement: forecast.model_agreement,
            probabilities: forecast.probabilities,
            weights: forecast.weights.clone(),
            model_predictions: forecast.component_labels(),
        })
    }

    /// Track a calibration ratio; sentinel records are ignored
    pub fn record_calibration(&mut self, record: &CalibrationRecord) -> Vec<Alert> {
        if record.is_sentinel() {
            return Vec::new();
        }
        self.calibration_ratios
            .insert(record.model.clone(), record.calibration_ratio);
        self.evaluate_alerts(record.timestamp)
    }

    /// Accuracy over the most recent `window` records, `None` below 2 records
    pub fn get_rolling_accuracy(&self, window: usize) -> Option<RollingAccuracy> {
        if self.records.len() < 2 || window == 0 {
            return None;
        }
        let recent = crate::stats::tail(&self.records, window);
        let correct = recent.iter().filter(|r| r.is_correct).count();

        let mut per_class = BTreeMap::new();
        for dir in Direction::ALL {
            let of_class: Vec<&PerformanceRecord> =
                recent.iter().filter(|r| r.actual == dir).collect();
            if of_class.is_empty() {
                continue;
            }
            let hits = of_class.iter().filter(|r| r.is_correct).count();
            per_class.insert(
                dir,
                ClassAccuracy {
                    n: of_class.len(),
                    correct: hits,
                    accuracy: hits as f64 / of_class.len() as f64,
                },
            );
        }

        Some(RollingAccuracy {
            window,
            n_samples: recent.len(),
            accuracy: correct as f64 / recent.len() as f64,
            per_class,
        })
    }

    /// Hit/miss history of one model over the last `window` records that
    /// carry its prediction, oldest first
    pub fn model_outcomes(&self, model: &str, window: usize) -> Vec<bool> {
        let mut hits: Vec<bool> = self
            .records
            .iter()
            .rev()
            .filter_map(|r| r.model_predictions.get(model).map(|p| *p == r.actual))
            .take(window)
            .collect();
        hits.reverse();
        hits
    }

    /// (accuracy, samples) for one model over the last `window` records
    pub fn model_accuracy(&self, model: &str, window: usize) -> Option<(f64, usize)> {
        let hits = self.model_outcomes(model, window);
        if hits.is_empty() {
            return None;
        }
        let correct = hits.iter().filter(|h| **h).count();
        Some((correct as f64 / hits.len() as f64, hits.len()))
    }

    /// Every model seen in any record
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .records
            .iter()
            .flat_map(|r| r.model_predictions.keys().cloned())
            .chain(self.weight_history.iter().flat_map(|(_, w)| w.models()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Rolling accuracy per model over `accuracy_window`
    pub fn model_rolling_accuracy(&self) -> BTreeMap<String, f64> {
        self.models()
            .into_iter()
            .filter_map(|m| {
                let (acc, _) = self.model_accuracy(&m, self.config.accuracy_window)?;
                Some((m, acc))
            })
            .collect()
    }

    /// Confidence bins of width 0.2 over every record with a finite confidence
    pub fn get_confidence_calibration(&self) -> Option<ConfidenceCalibration> {
        let scored = self.records.iter().filter(|r| r.confidence.is_finite()).count();
        if scored == 0 {
            return None;
        }
        let mut counts = [0usize; N_CONFIDENCE_BINS];
        let mut hits = [0usize; N_CONFIDENCE_BINS];
        let mut conf_sums = [0.0f64; N_CONFIDENCE_BINS];

        for r in self.records.iter().filter(|r| r.confidence.is_finite()) {
            let conf = r.confidence.clamp(0.0, 1.0);
            let bin = ((conf / CONFIDENCE_BIN_WIDTH) as usize).min(N_CONFIDENCE_BINS - 1);
            counts[bin] += 1;
            conf_sums[bin] += conf;
            if r.is_correct {
                hits[bin] += 1;
            }
        }

        let total = scored as f64;
        let mut ece = 0.0;
        let mut bins = Vec::new();
        for i in 0..N_CONFIDENCE_BINS {
            if counts[i] == 0 {
                continue;
            }
            let n = counts[i] as f64;
            let accuracy = hits[i] as f64 / n;
            let mean_confidence = conf_sums[i] / n;
            ece += (n / total) * (accuracy - mean_confidence).abs();
            bins.push(CalibrationBin {
                lower: i as f64 * CONFIDENCE_BIN_WIDTH,
                upper: (i + 1) as f64 * CONFIDENCE_BIN_WIDTH,
                n: counts[i],
                accuracy,
                mean_confidence,
            });
        }

        Some(ConfidenceCalibration {
            bins,
            ece,
            n_samples: scored,
            well_calibrated: ece < self.config.ece_threshold,
        })
    }

    fn evaluate_alerts(&mut self, at: DateTime<Utc>) -> Vec<Alert> {
        if self.records.len() < self.config.min_samples_for_alert {
            return Vec::new();
        }
        let mut candidates = Vec::new();

        if let Some(rolling) = self.get_rolling_accuracy(self.config.accuracy_window) {
            if rolling.accuracy < self.config.low_accuracy_threshold {
                candidates.push(self.build_alert(
                    at,
                    AlertType::LowAccuracy,
                    AlertSeverity::Warning,
                    format!(
                        "Rolling accuracy {:.1}% below {:.1}% over {} predictions",
                        rolling.accuracy * 100.0,
                        self.config.low_accuracy_threshold * 100.0,
                        rolling.n_samples
                    ),
                    "rolling_accuracy",
                    rolling.accuracy,
                    self.config.low_accuracy_threshold,
                    None,
                ));
            }
        }

        for model in self.models() {
            let Some((acc, n)) = self.model_accuracy(&model, self.config.accuracy_window) else {
                continue;
            };
            if n >= self.config.min_samples_for_alert && acc < self.config.model_degradation_threshold {
                candidates.push(self.build_alert(
                    at,
                    AlertType::ModelDegradation,
                    AlertSeverity::Warning,
                    format!(
                        "Model {} accuracy {:.1}% below {:.1}% over {} predictions",
                        model,
                        acc * 100.0,
                        self.config.model_degradation_threshold * 100.0,
                        n
                    ),
                    "model_accuracy",
                    acc,
                    self.config.model_degradation_threshold,
                    Some(model.clone()),
                ));
            }
        }

        let w = self.config.drop_window;
        if w > 0 && self.records.len() >= 2 * w {
            let recent = crate::stats::tail(&self.records, 2 * w);
            let accuracy = |rs: &[PerformanceRecord]| {
                rs.iter().filter(|r| r.is_correct).count() as f64 / rs.len() as f64
            };
            let prior = accuracy(&recent[..w]);
            let last = accuracy(&recent[w..]);
            let drop = prior - last;
            if drop >= self.config.accuracy_drop_threshold - 1e-9 {
                candidates.push(self.build_alert(
                    at,
                    AlertType::AccuracyDrop,
                    AlertSeverity::Critical,
                    format!(
                        "Accuracy fell from {:.1}% to {:.1}% over the last {} predictions",
                        prior * 100.0,
                        last * 100.0,
                        w
                    ),
                    "accuracy_drop",
                    drop,
                    self.config.accuracy_drop_threshold,
                    None,
                ));
            }
        }

        for (model, ratio) in &self.calibration_ratios {
            let drift = (ratio - 1.0).abs();
            if drift > self.config.calibration_drift_tolerance {
                candidates.push(self.build_alert(
                    at,
                    AlertType::CalibrationDrift,
                    AlertSeverity::Warning,
                    format!(
                        "Calibration ratio for {} is {:.3} ({} coverage)",
                        model,
                        ratio,
                        if *ratio < 1.0 { "under" } else { "over" }
                    ),
                    "calibration_ratio",
                    *ratio,
                    self.config.calibration_drift_tolerance,
                    Some(model.clone()),
                ));
            }
        }

        if let Some(cal) = self.get_confidence_calibration() {
            if !cal.well_calibrated {
                candidates.push(self.build_alert(
                    at,
                    AlertType::PoorConfidenceCalibration,
                    AlertSeverity::Info,
                    format!(
                        "Confidence calibration error {:.3} at or above {:.3}",
                        cal.ece, self.config.ece_threshold
                    ),
                    "ece",
                    cal.ece,
                    self.config.ece_threshold,
                    None,
                ));
            }
        }

        let mut raised = Vec::new();
        for alert in candidates {
            if self.suppressed(&alert) {
                tracing::debug!("Suppressed duplicate {} alert", alert.alert_type);
                continue;
            }
            match alert.severity {
                AlertSeverity::Critical => tracing::error!("ALERT {}: {}", alert.alert_type, alert.message),
                AlertSeverity::Warning => tracing::warn!("ALERT {}: {}", alert.alert_type, alert.message),
                AlertSeverity::Info => tracing::info!("ALERT {}: {}", alert.alert_type, alert.message),
            }
            self.last_fired
                .insert((alert.alert_type, alert.model.clone()), alert.timestamp);
            self.alerts.push_back(alert.clone());
            while self.alerts.len() > self.config.max_alerts {
                self.alerts.pop_front();
            }
            raised.push(alert);
        }
        raised
    }

    /// Same (type, model) fired within the cooldown
    fn suppressed(&self, alert: &Alert) -> bool {
        let cooldown = Duration::seconds(self.config.alert_cooldown_secs);
        match self.last_fired.get(&(alert.alert_type, alert.model.clone())) {
            Some(last) => alert.timestamp - *last < cooldown,
            None => false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_alert(
        &self,
        timestamp: DateTime<Utc>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        metric: &str,
        value: f64,
        threshold: f64,
        model: Option<String>,
    ) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            timestamp,
            alert_type,
            severity,
            message,
            metric: metric.to_string(),
            value,
            threshold,
            model,
            acknowledged: false,
        }
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    /// Alerts raised at or after `since`, oldest first
    pub fn alerts_since(&self, since: DateTime<Utc>) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|a| a.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.alerts.iter().filter(|a| !a.acknowledged).cloned().collect()
    }

    /// Mark an alert as seen; false if the id is unknown
    pub fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn records(&self) -> &[PerformanceRecord] {
        &self.records
    }

    pub fn weight_history(&self) -> &[(DateTime<Utc>, WeightVector)] {
        &self.weight_history
    }

    /// One model's weight over time, oldest first
    pub fn weight_series(&self, model: &str) -> Vec<f64> {
        self.weight_history
            .iter()
            .map(|(_, w)| w.get(model))
            .collect()
    }

    pub fn calibration_ratios(&self) -> &BTreeMap<String, f64> {
        &self.calibration_ratios
    }

    pub fn performance_rows(&self) -> Vec<PerformanceRow> {
        self.records.iter().map(PerformanceRow::from).collect()
    }

    pub fn dashboard_summary(&self, health: &ModelHealthChecker) -> DashboardSummary {
        DashboardSummary::build(self, health)
    }
}
