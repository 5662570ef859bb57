//! Tests for model module

use super::*;
use crate::error::ForecastError;
use crate::testing::{synthetic_frame, SyntheticConfig};
use crate::types::Direction;

fn frame(rows: usize) -> MarketFrame {
    synthetic_frame(&SyntheticConfig {
        rows,
        seed: 3,
        ..Default::default()
    })
}

#[test]
fn test_param_fallback() {
    let mut params = ParamSet::new();
    params.insert("lookback".to_string(), 12.0);
    params.insert("ridge".to_string(), f64::NAN);

    assert_eq!(param(&params, "lookback", 20.0), 12.0);
    assert_eq!(param(&params, "ridge", 0.5), 0.5);
    assert_eq!(param(&params, "missing", 1.0), 1.0);
}

#[test]
fn test_gaussian_probabilities() {
    let p = reference::gaussian_class_probabilities(0.01, 0.005, 0.001);
    assert!(p.is_valid());
    assert_eq!(p.argmax(), Direction::Bullish);

    let symmetric = reference::gaussian_class_probabilities(0.0, 0.01, 0.001);
    assert!((symmetric.get(Direction::Bullish) - symmetric.get(Direction::Bearish)).abs() < 1e-9);

    let degenerate = reference::gaussian_class_probabilities(-0.02, 0.0, 0.001);
    assert_eq!(degenerate.get(Direction::Bearish), 1.0);
}

#[test]
fn test_drift_model_predicts_trailing_mean() {
    let data = frame(60);
    let mut model = DriftModel::new("drift", 20);
    assert!(model.predict(&data).is_err());

    model.train(&data).unwrap();
    let output = model.predict(&data).unwrap();
    output.validate("drift").unwrap();

    let expected = crate::stats::mean(crate::stats::tail(&data.returns, 20)).unwrap();
    assert!((output.forecast_return.unwrap() - expected).abs() < 1e-12);
    let (lo, hi) = (output.ci_lower.unwrap(), output.ci_upper.unwrap());
    assert!(lo < expected && expected < hi);
    assert_eq!(model.kind(), ModelKind::Baseline);
}

#[test]
fn test_drift_model_needs_returns() {
    let mut data = frame(30);
    data.returns.clear();
    let err = DriftModel::new("drift", 10).train(&data).unwrap_err();
    assert!(matches!(err, ForecastError::ModelFailure { .. }));
}

#[test]
fn test_signal_model_learns_feature() {
    let data = synthetic_frame(&SyntheticConfig {
        rows: 200,
        seed: 5,
        signal_strength: 0.9,
        ..Default::default()
    });
    let mut model = SignalModel::new("feature", SignalKind::Feature(1), 1);
    model.train(&data).unwrap();

    let hits = (150..199)
        .filter(|&i| {
            let view = data.head(i + 1);
            let output = model.predict(&view).unwrap();
            output.forecast_return.unwrap().signum() == data.returns[i].signum()
        })
        .count();
    assert!(hits > 35, "hits = {}", hits);
}

#[test]
fn test_signal_model_from_params() {
    let mut params = ParamSet::new();
    params.insert("lookback".to_string(), 5.0);
    let mut model = SignalModel::from_params("momentum", SignalKind::Momentum, &params);
    let data = frame(40);
    model.train(&data).unwrap();
    assert!(model.predict(&data).is_ok());

    // first `lookback` rows carry no momentum signal
    assert!(model.predict(&data.head(5)).is_err());
}

#[test]
fn test_signal_model_short_history() {
    let mut model = SignalModel::mean_reversion("mr", 10);
    let err = model.train(&frame(11)).unwrap_err();
    assert!(matches!(err, ForecastError::InsufficientData { .. }));
}

#[test]
fn test_model_kind_serde() {
    let kinds: Vec<ModelKind> = serde_json::from_str(r#"["arima_garch", "lstm"]"#).unwrap();
    assert_eq!(kinds, vec![ModelKind::ArimaGarch, ModelKind::Lstm]);
}
