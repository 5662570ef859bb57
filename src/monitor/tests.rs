//! Tests for performance monitoring

use super::*;
use crate::config::{HealthConfig, MonitorConfig};
use crate::types::{ClassProbabilities, Direction, WeightVector};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

fn outcome(at: DateTime<Utc>, correct: bool) -> PredictionInput {
    let actual = if correct {
        Direction::Bullish
    } else {
        Direction::Bearish
    };
    PredictionInput::simple(at, Direction::Bullish, actual, 0.6)
}

fn count(alerts: &[Alert], kind: AlertType) -> usize {
    alerts.iter().filter(|a| a.alert_type == kind).count()
}

#[test]
fn test_low_accuracy_alert_respects_cooldown() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let mut raised = Vec::new();
    let mut at = t0();

    for i in 0..20 {
        raised.extend(monitor.record_prediction(outcome(at, i % 2 == 0)));
        at += Duration::minutes(1);
    }
    assert_eq!(count(&raised, AlertType::LowAccuracy), 0);

    for i in 0..20 {
        raised.extend(monitor.record_prediction(outcome(at, i % 10 < 3)));
        at += Duration::minutes(1);
    }
    assert_eq!(count(&raised, AlertType::LowAccuracy), 1);
    let alert = raised
        .iter()
        .find(|a| a.alert_type == AlertType::LowAccuracy)
        .unwrap();
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert!(alert.value < 0.45);

    let later = monitor.record_prediction(outcome(at + Duration::hours(2), false));
    assert_eq!(count(&later, AlertType::LowAccuracy), 1);
}

#[test]
fn test_no_alerts_before_min_samples() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    for i in 0..19 {
        let alerts = monitor.record_prediction(outcome(t0() + Duration::minutes(i), false));
        assert!(alerts.is_empty());
    }
}

#[test]
fn test_accuracy_drop_is_critical() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let mut raised = Vec::new();
    for i in 0..20 {
        raised.extend(monitor.record_prediction(outcome(t0() + Duration::minutes(i), i < 10)));
    }
    let drop = raised
        .iter()
        .find(|a| a.alert_type == AlertType::AccuracyDrop)
        .expect("drop alert");
    assert_eq!(drop.severity, AlertSeverity::Critical);
    assert!((drop.value - 1.0).abs() < 1e-12);
}

#[test]
fn test_model_degradation_per_model() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let mut raised = Vec::new();
    for i in 0..24 {
        let mut input = outcome(t0() + Duration::minutes(i), true);
        input.model_predictions = BTreeMap::from([
            ("good".to_string(), Direction::Bullish),
            ("bad".to_string(), Direction::Bearish),
        ]);
        raised.extend(monitor.record_prediction(input));
    }

    let degraded: Vec<&Alert> = raised
        .iter()
        .filter(|a| a.alert_type == AlertType::ModelDegradation)
        .collect();
    assert_eq!(degraded.len(), 1);
    assert_eq!(degraded[0].model.as_deref(), Some("bad"));
    assert_eq!(monitor.model_accuracy("good", 50), Some((1.0, 24)));
}

#[test]
fn test_calibration_drift_alert() {
    let config = MonitorConfig {
        min_samples_for_alert: 2,
        ..Default::default()
    };
    let mut monitor = PerformanceMonitor::new(config);
    monitor.record_prediction(outcome(t0(), true));
    monitor.record_prediction(outcome(t0() + Duration::minutes(1), true));

    let record = CalibrationRecord {
        model: "ensemble".to_string(),
        empirical_coverage: Some(0.7),
        target_coverage: 0.95,
        calibration_ratio: 0.7 / 0.95,
        n_samples: 40,
        timestamp: t0() + Duration::minutes(2),
        error: None,
    };
    let alerts = monitor.record_calibration(&record);
    assert_eq!(count(&alerts, AlertType::CalibrationDrift), 1);
    assert_eq!(monitor.calibration_ratios().len(), 1);

    let sentinel = CalibrationRecord {
        model: "other".to_string(),
        empirical_coverage: None,
        calibration_ratio: 1.0,
        n_samples: 5,
        error: Some("insufficient data".to_string()),
        ..record
    };
    assert!(monitor.record_calibration(&sentinel).is_empty());
    assert!(!monitor.calibration_ratios().contains_key("other"));
}

#[test]
fn test_rolling_accuracy_breakdown() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    assert!(monitor.get_rolling_accuracy(50).is_none());

    monitor.record_prediction(PredictionInput::simple(
        t0(),
        Direction::Bullish,
        Direction::Bullish,
        0.7,
    ));
    assert!(monitor.get_rolling_accuracy(50).is_none());

    monitor.record_prediction(PredictionInput::simple(
        t0() + Duration::minutes(1),
        Direction::Bullish,
        Direction::Bearish,
        0.7,
    ));
    monitor.record_prediction(PredictionInput::simple(
        t0() + Duration::minutes(2),
        Direction::Neutral,
        Direction::Neutral,
        0.5,
    ));

    let rolling = monitor.get_rolling_accuracy(50).unwrap();
    assert_eq!(rolling.n_samples, 3);
    assert!((rolling.accuracy - 2.0 / 3.0).abs() < 1e-12);
    assert_eq!(rolling.per_class[&Direction::Bearish].correct, 0);
    assert_eq!(rolling.per_class[&Direction::Neutral].accuracy, 1.0);

    let last_two = monitor.get_rolling_accuracy(2).unwrap();
    assert_eq!(last_two.n_samples, 2);
    assert_eq!(last_two.accuracy, 0.5);
}

#[test]
fn test_confidence_calibration_ece() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    assert!(monitor.get_confidence_calibration().is_none());

    // 10 records at 0.9 confidence, 9 correct: perfectly calibrated bin
    for i in 0..10 {
        monitor.record_prediction(PredictionInput::simple(
            t0() + Duration::minutes(i),
            Direction::Bullish,
            if i < 9 { Direction::Bullish } else { Direction::Bearish },
            0.9,
        ));
    }
    let cal = monitor.get_confidence_calibration().unwrap();
    assert_eq!(cal.bins.len(), 1);
    assert!(cal.ece < 1e-9);
    assert!(cal.well_calibrated);

    // 10 more at 0.3 confidence, all correct
    for i in 10..20 {
        monitor.record_prediction(PredictionInput::simple(
            t0() + Duration::minutes(i),
            Direction::Bullish,
            Direction::Bullish,
            0.3,
        ));
    }
    let cal = monitor.get_confidence_calibration().unwrap();
    assert_eq!(cal.bins.len(), 2);
    assert!((cal.ece - 0.35).abs() < 1e-9);
    assert!(!cal.well_calibrated);
}

#[test]
fn test_non_finite_confidence_left_out_of_bins() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let mut raised = Vec::new();
    for i in 0..20 {
        raised.extend(monitor.record_prediction(PredictionInput::simple(
            t0() + Duration::minutes(i),
            Direction::Bullish,
            if i % 10 == 9 { Direction::Bearish } else { Direction::Bullish },
            0.9,
        )));
    }
    raised.extend(monitor.record_prediction(PredictionInput::simple(
        t0() + Duration::minutes(20),
        Direction::Bullish,
        Direction::Bullish,
        f64::NAN,
    )));

    let cal = monitor.get_confidence_calibration().unwrap();
    assert_eq!(cal.n_samples, 20);
    assert!(cal.ece.is_finite() && cal.ece < 1e-9);
    assert!(cal.well_calibrated);
    assert_eq!(count(&raised, AlertType::PoorConfidenceCalibration), 0);
    assert!(raised.iter().all(|a| a.value.is_finite()));
}

#[test]
fn test_acknowledge_and_feed() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    for i in 0..20 {
        monitor.record_prediction(outcome(t0() + Duration::minutes(i), false));
    }
    let active = monitor.active_alerts();
    assert!(!active.is_empty());

    let id = active[0].id;
    assert!(monitor.acknowledge(id));
    assert!(!monitor.acknowledge(uuid::Uuid::new_v4()));
    assert_eq!(monitor.active_alerts().len(), active.len() - 1);
    assert_eq!(monitor.alerts().count(), active.len());

    assert_eq!(monitor.alerts_since(t0()).len(), active.len());
    assert!(monitor.alerts_since(t0() + Duration::hours(1)).is_empty());
}

#[test]
fn test_alert_buffer_is_capped() {
    let config = MonitorConfig {
        min_samples_for_alert: 2,
        alert_cooldown_secs: 0,
        max_alerts: 5,
        ..Default::default()
    };
    let mut monitor = PerformanceMonitor::new(config);
    for i in 0..30 {
        monitor.record_prediction(outcome(t0() + Duration::minutes(i), false));
    }
    assert_eq!(monitor.alerts().count(), 5);
}

#[test]
fn test_weight_trend() {
    let checker = ModelHealthChecker::new(HealthConfig::default());
    assert_eq!(checker.weight_trend(&[]), WeightTrend::Stable);
    assert_eq!(checker.weight_trend(&[0.5]), WeightTrend::Stable);

    let rising = [0.2, 0.2, 0.2, 0.2, 0.2, 0.3, 0.3, 0.3, 0.3, 0.3];
    assert_eq!(checker.weight_trend(&rising), WeightTrend::Increasing);

    let falling: Vec<f64> = rising.iter().rev().copied().collect();
    assert_eq!(checker.weight_trend(&falling), WeightTrend::Decreasing);

    let flat = [0.3, 0.31, 0.3, 0.29, 0.3, 0.3, 0.31, 0.3, 0.3, 0.3];
    assert_eq!(checker.weight_trend(&flat), WeightTrend::Stable);

    // short series compare halves
    assert_eq!(checker.weight_trend(&[0.1, 0.5]), WeightTrend::Increasing);
}

#[test]
fn test_model_health_status() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let checker = ModelHealthChecker::new(HealthConfig::default());

    for i in 0..30 {
        let mut input = outcome(t0() + Duration::minutes(i), true);
        input.model_predictions = BTreeMap::from([
            ("strong".to_string(), Direction::Bullish),
            (
                "middling".to_string(),
                if i % 2 == 0 { Direction::Bullish } else { Direction::Bearish },
            ),
            ("weak".to_string(), Direction::Bearish),
        ]);
        let mut raw = BTreeMap::new();
        raw.insert("strong".to_string(), 0.1 + 0.02 * i as f64);
        raw.insert("middling".to_string(), 0.2);
        raw.insert("weak".to_string(), 0.7 - 0.02 * i as f64);
        input.weights = WeightVector::from_raw(raw);
        monitor.record_prediction(input);
    }
    let mut late = outcome(t0() + Duration::minutes(30), true);
    late.model_predictions = BTreeMap::from([("newcomer".to_string(), Direction::Bullish)]);
    monitor.record_prediction(late);

    let by_model: BTreeMap<String, ModelHealth> = checker
        .check_all(&monitor)
        .into_iter()
        .map(|h| (h.model.clone(), h))
        .collect();

    assert_eq!(by_model["strong"].status, HealthStatus::Healthy);
    assert_eq!(by_model["strong"].weight_trend, WeightTrend::Increasing);
    assert_eq!(by_model["middling"].status, HealthStatus::Marginal);
    assert_eq!(by_model["weak"].status, HealthStatus::Unhealthy);
    assert_eq!(by_model["weak"].weight_trend, WeightTrend::Decreasing);
    assert_eq!(by_model["newcomer"].status, HealthStatus::WarmingUp);
    assert_eq!(by_model["newcomer"].n_samples, 1);
    assert!(by_model["strong"].current_weight.is_some());
}

#[test]
fn test_dashboard_summary_and_rows() {
    let mut monitor = PerformanceMonitor::new(MonitorConfig::default());
    let checker = ModelHealthChecker::default();
    let empty = monitor.dashboard_summary(&checker);
    assert_eq!(empty.total_predictions, 0);
    assert!(empty.overall_accuracy.is_none());

    for i in 0..4 {
        let mut input = outcome(t0() + Duration::minutes(i), i != 3);
        input.probabilities = ClassProbabilities::new(0.6, 0.2, 0.2);
        input.agreement = 0.5;
        monitor.record_prediction(input);
    }
    let summary = monitor.dashboard_summary(&checker);
    assert_eq!(summary.total_predictions, 4);
    assert_eq!(summary.overall_accuracy, Some(0.75));
    assert_eq!(summary.mean_agreement, Some(0.5));
    assert_eq!(summary.last_updated, Some(t0() + Duration::minutes(3)));

    let rows = monitor.performance_rows();
    assert_eq!(rows.len(), 4);
    assert!(!rows[3].is_correct);
    let json = serde_json::to_value(&summary).unwrap();
    assert!(json.get("active_alerts").is_some());
}
