//! Dashboard summary and tabular exports
//!
//! Serializable snapshots of monitor state for whatever renders them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Alert, ModelHealth, ModelHealthChecker, PerformanceMonitor, PerformanceRecord};
use crate::types::Direction;

/// Core metrics displayed on the dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSummary {
    /// Total realized outcomes recorded
    pub total_predictions: usize,
    /// Rolling accuracy over the configured window
    pub rolling_accuracy: Option<f64>,
    /// Accuracy over every record
    pub overall_accuracy: Option<f64>,
    /// Expected calibration error of reported confidence
    pub ece: Option<f64>,
    pub well_calibrated: Option<bool>,
    /// Mean model agreement
    pub mean_agreement: Option<f64>,
    /// Latest ensemble weights
    pub current_weights: BTreeMap<String, f64>,
    pub calibration_ratios: BTreeMap<String, f64>,
    pub model_health: Vec<ModelHealth>,
    /// Unacknowledged alerts
    pub active_alerts: Vec<Alert>,
    pub total_alerts: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl DashboardSummary {
    pub fn build(monitor: &PerformanceMonitor, health: &ModelHealthChecker) -> Self {
        let records = monitor.records();
        let overall_accuracy = if records.is_empty() {
            None
        } else {
            Some(records.iter().filter(|r| r.is_correct).count() as f64 / records.len() as f64)
        };
        let agreements: Vec<f64> = records.iter().map(|r| r.agreement).collect();
        let calibration = monitor.get_confidence_calibration();

        Self {
            total_predictions: records.len(),
            rolling_accuracy: monitor
                .get_rolling_accuracy(monitor.config().accuracy_window)
                .map(|r| r.accuracy),
            overall_accuracy,
            ece: calibration.as_ref().map(|c| c.ece),
            well_calibrated: calibration.as_ref().map(|c| c.well_calibrated),
            mean_agreement: crate::stats::mean(&agreements),
            current_weights: monitor
                .weight_history()
                .last()
                .map(|(_, w)| w.as_map().clone())
                .unwrap_or_default(),
            calibration_ratios: monitor.calibration_ratios().clone(),
            model_health: health.check_all(monitor),
            active_alerts: monitor.active_alerts(),
            total_alerts: monitor.alerts().count(),
            last_updated: records.last().map(|r| r.timestamp),
        }
    }
}

/// Flat row per recorded outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRow {
    pub timestamp: DateTime<Utc>,
    pub prediction: Direction,
    pub actual: Direction,
    pub actual_return: Option<f64>,
    pub confidence: f64,
    pub agreement: f64,
    pub is_correct: bool,
}

impl From<&PerformanceRecord> for PerformanceRow {
    fn from(r: &PerformanceRecord) -> Self {
        Self {
            timestamp: r.timestamp,
            prediction: r.prediction,
            actual: r.actual,
            actual_return: r.actual_return,
            confidence: r.confidence,
            agreement: r.agreement,
            is_correct: r.is_correct,
        }
    }
}
