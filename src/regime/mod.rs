//! Market Regime Detection Module
//!
//! Classifies a bar history into a coarse market regime so that ensemble
//! weights can be learned and applied per regime:
//! - **Trending**: strong directional movement (bullish/bearish)
//! - **Ranging**: sideways consolidation with subdued volatility
//! - **Volatile**: elevated volatility without a clear direction
//! - **Crisis**: volatility far above its own history
//!
//! Uses two indicators:
//! - Directional movement index (ADX with +DI / -DI) for trend strength
//! - ATR relative to the longer-run average true range for volatility

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::OhlcBar;

/// Market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    /// Strong upward trend (ADX above threshold, +DI > -DI)
    BullishTrend,
    /// Strong downward trend (ADX above threshold, -DI > +DI)
    BearishTrend,
    /// Sideways consolidation (low ADX, below-average volatility)
    Ranging,
    /// High volatility, no clear direction
    Volatile,
    /// Extreme market stress
    Crisis,
    /// Insufficient data to determine
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::BullishTrend => "bullish_trend",
            MarketRegime::BearishTrend => "bearish_trend",
            MarketRegime::Ranging => "ranging",
            MarketRegime::Volatile => "volatile",
            MarketRegime::Crisis => "crisis",
            MarketRegime::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for regime detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// ADX threshold for trend detection (typically 25)
    pub adx_trend_threshold: f64,
    /// ADX below this counts as directionless (typically 20)
    pub adx_range_threshold: f64,
    /// ATR / long-run TR ratio marking high volatility
    pub high_volatility_ratio: f64,
    /// ATR / long-run TR ratio marking crisis
    pub crisis_volatility_ratio: f64,
    /// Minimum bars required for detection
    pub min_bars: usize,
    /// Lookback period for ADX calculation
    pub adx_period: usize,
    /// Lookback period for ATR calculation
    pub atr_period: usize,
    /// Lookback for the long-run true range baseline
    pub volatility_lookback: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            adx_trend_threshold: 25.0,
            adx_range_threshold: 20.0,
            high_volatility_ratio: 1.5,
            crisis_volatility_ratio: 2.5,
            min_bars: 20,
            adx_period: 14,
            atr_period: 14,
            volatility_lookback: 100,
        }
    }
}

/// Regime detection result with confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeDetection {
    /// Detected regime
    pub regime: MarketRegime,
    /// Confidence level (0-1)
    pub confidence: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    pub atr: f64,
    /// Volatility ratio (current ATR / long-run average true range)
    pub volatility_ratio: f64,
    /// Timestamp of the last bar used
    pub timestamp: Option<DateTime<Utc>>,
}

/// Stateless regime classifier over a bar history
#[derive(Debug, Clone, Default)]
pub struct RegimeDetector {
    config: RegimeConfig,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Classify the regime at the last bar of `bars`
    pub fn detect(&self, bars: &[OhlcBar]) -> RegimeDetection {
        let timestamp = bars.last().map(|b| b.timestamp);
        let min_needed = self
            .config
            .min_bars
            .max(self.config.adx_period + 1)
            .max(self.config.atr_period + 1);

        if bars.len() < min_needed {
            return RegimeDetection {
                regime: MarketRegime::Unknown,
                confidence: 0.0,
                adx: 0.0,
                plus_di: 0.0,
                minus_di: 0.0,
                atr: 0.0,
                volatility_ratio: 1.0,
                timestamp,
            };
        }

        let (adx, plus_di, minus_di) = self.directional_index(bars);
        let atr = self.average_true_range(bars);
        let baseline = self.true_range_baseline(bars);
        let volatility_ratio = if baseline > 0.0 { atr / baseline } else { 1.0 };

        let (regime, confidence) = self.classify(adx, plus_di, minus_di, volatility_ratio);

        RegimeDetection {
            regime,
            confidence,
            adx,
            plus_di,
            minus_di,
            atr,
            volatility_ratio,
            timestamp,
        }
    }

    /// Regime at every row, each using only the bars up to that row
    pub fn label_series(&self, bars: &[OhlcBar]) -> Vec<MarketRegime> {
        (0..bars.len())
            .map(|i| self.detect(&bars[..=i]).regime)
            .collect()
    }

    fn classify(
        &self,
        adx: f64,
        plus_di: f64,
        minus_di: f64,
        volatility_ratio: f64,
    ) -> (MarketRegime, f64) {
        // Crisis detection (highest priority)
        if volatility_ratio >= self.config.crisis_volatility_ratio {
            let confidence = (volatility_ratio / self.config.crisis_volatility_ratio - 1.0 + 0.5).min(1.0);
            return (MarketRegime::Crisis, confidence);
        }

        if volatility_ratio >= self.config.high_volatility_ratio
            && adx < self.config.adx_trend_threshold
        {
            let span = self.config.crisis_volatility_ratio - self.config.high_volatility_ratio;
            let confidence = if span > 0.0 {
                (volatility_ratio - self.config.high_volatility_ratio) / span
            } else {
                1.0
            };
            return (MarketRegime::Volatile, confidence.clamp(0.0, 1.0));
        }

        if adx >= self.config.adx_trend_threshold {
            let confidence = ((adx - self.config.adx_trend_threshold)
                / (100.0 - self.config.adx_trend_threshold))
                .clamp(0.0, 1.0)
                .max(0.5);
            return if plus_di >= minus_di {
                (MarketRegime::BullishTrend, confidence)
            } else {
                (MarketRegime::BearishTrend, confidence)
            };
        }

        if adx < self.config.adx_range_threshold && volatility_ratio < 1.0 {
            let confidence = (self.config.adx_range_threshold - adx) / self.config.adx_range_threshold;
            return (MarketRegime::Ranging, confidence.clamp(0.0, 1.0));
        }

        (MarketRegime::Unknown, 0.5)
    }

    /// ADX with +DI and -DI over the configured period
    fn directional_index(&self, bars: &[OhlcBar]) -> (f64, f64, f64) {
        let period = self.config.adx_period;
        let start = bars.len() - period;

        let mut plus_dm_sum = 0.0;
        let mut minus_dm_sum = 0.0;
        let mut tr_sum = 0.0;

        for idx in start..bars.len() {
            let current = &bars[idx];
            let prev = &bars[idx - 1];

            tr_sum += true_range(current, prev);

            let up_move = current.high - prev.high;
            let down_move = prev.low - current.low;

            if up_move > down_move && up_move > 0.0 {
                plus_dm_sum += up_move;
            }
            if down_move > up_move && down_move > 0.0 {
                minus_dm_sum += down_move;
            }
        }

        if tr_sum <= 0.0 {
            return (0.0, 0.0, 0.0);
        }

        let plus_di = plus_dm_sum / tr_sum * 100.0;
        let minus_di = minus_dm_sum / tr_sum * 100.0;
        let di_sum = plus_di + minus_di;
        let dx = if di_sum > 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        };

        // Single-period DX stands in for the smoothed ADX
        (dx, plus_di, minus_di)
    }

    fn average_true_range(&self, bars: &[OhlcBar]) -> f64 {
        let period = self.config.atr_period;
        let start = bars.len() - period;
        let sum: f64 = (start..bars.len())
            .map(|i| true_range(&bars[i], &bars[i - 1]))
            .sum();
        sum / period as f64
    }

    fn true_range_baseline(&self, bars: &[OhlcBar]) -> f64 {
        let start = bars.len().saturating_sub(self.config.volatility_lookback).max(1);
        let count = bars.len() - start;
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = (start..bars.len())
            .map(|i| true_range(&bars[i], &bars[i - 1]))
            .sum();
        sum / count as f64
    }
}

fn true_range(current: &OhlcBar, prev: &OhlcBar) -> f64 {
    (current.high - current.low)
        .max((current.high - prev.close).abs())
        .max((current.low - prev.close).abs())
}
