//! Tests for regime detection

use super::*;
use chrono::Duration;

fn bar(i: usize, open: f64, close: f64, pad: f64) -> OhlcBar {
    let start = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
    OhlcBar {
        timestamp: start + Duration::days(i as i64),
        open,
        high: open.max(close) + pad,
        low: open.min(close) - pad,
        close,
        volume: 1000.0,
    }
}

fn create_trending_bars(n: usize, up: bool) -> Vec<OhlcBar> {
    let step = if up { 1.0 } else { -1.0 };
    let mut price = 100.0;
    (0..n)
        .map(|i| {
            let open = price;
            price += step;
            bar(i, open, price, 0.5)
        })
        .collect()
}

/// Closes alternate between 100 and 100 + swing; each segment is
/// (bars, swing, pad).
fn create_oscillating_bars(segments: &[(usize, f64, f64)]) -> Vec<OhlcBar> {
    let mut bars = Vec::new();
    let mut prev_close = 100.0;
    for &(count, swing, pad) in segments {
        for _ in 0..count {
            let i = bars.len();
            let close = if i % 2 == 1 { 100.0 + swing } else { 100.0 };
            bars.push(bar(i, prev_close, close, pad));
            prev_close = close;
        }
    }
    bars
}

#[test]
fn test_bullish_trend_detection() {
    let detector = RegimeDetector::default();
    let detection = detector.detect(&create_trending_bars(50, true));

    assert_eq!(detection.regime, MarketRegime::BullishTrend);
    assert!(detection.plus_di > detection.minus_di);
    assert!((detection.adx - 100.0).abs() < 1e-9);
    assert!((detection.volatility_ratio - 1.0).abs() < 1e-9);
    assert!(detection.confidence >= 0.5 && detection.confidence <= 1.0);
}

#[test]
fn test_bearish_trend_detection() {
    let detection = RegimeDetector::default().detect(&create_trending_bars(50, false));
    assert_eq!(detection.regime, MarketRegime::BearishTrend);
    assert!(detection.minus_di > detection.plus_di);
}

#[test]
fn test_ranging_market_detection() {
    // wide swings, then a calm stretch
    let bars = create_oscillating_bars(&[(40, 2.0, 1.0), (20, 0.2, 0.3)]);
    let detection = RegimeDetector::default().detect(&bars);

    assert_eq!(detection.regime, MarketRegime::Ranging);
    assert_eq!(detection.adx, 0.0);
    assert!(detection.volatility_ratio < 1.0);
}

#[test]
fn test_volatile_market_detection() {
    let bars = create_oscillating_bars(&[(60, 0.5, 0.25), (16, 1.0, 0.5)]);
    let detection = RegimeDetector::default().detect(&bars);

    assert_eq!(detection.regime, MarketRegime::Volatile);
    assert!((detection.atr - 2.0).abs() < 1e-9);
    assert!(detection.volatility_ratio >= 1.5 && detection.volatility_ratio < 2.5);
}

#[test]
fn test_crisis_detection() {
    let bars = create_oscillating_bars(&[(60, 0.5, 0.25), (16, 3.0, 1.0)]);
    let detection = RegimeDetector::default().detect(&bars);

    assert_eq!(detection.regime, MarketRegime::Crisis);
    assert!(detection.volatility_ratio >= 2.5);
}

#[test]
fn test_minimum_bars_requirement() {
    let detector = RegimeDetector::new(RegimeConfig {
        min_bars: 20,
        ..Default::default()
    });
    let bars = create_trending_bars(15, true);
    let detection = detector.detect(&bars);

    assert_eq!(detection.regime, MarketRegime::Unknown);
    assert_eq!(detection.confidence, 0.0);
    assert_eq!(detection.timestamp, bars.last().map(|b| b.timestamp));
    assert_eq!(detector.detect(&[]).timestamp, None);
}

#[test]
fn test_label_series_uses_only_past_bars() {
    let detector = RegimeDetector::default();
    let bars = create_trending_bars(30, true);
    let labels = detector.label_series(&bars);

    assert_eq!(labels.len(), bars.len());
    assert!(labels[..19].iter().all(|r| *r == MarketRegime::Unknown));
    assert_eq!(labels[29], detector.detect(&bars).regime);
}

#[test]
fn test_regime_wire_names() {
    assert_eq!(MarketRegime::Crisis.to_string(), "crisis");
    assert_eq!(
        serde_json::to_string(&MarketRegime::BullishTrend).unwrap(),
        "\"bullish_trend\""
    );
}
