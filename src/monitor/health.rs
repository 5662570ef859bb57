//! Per-model health classification

use serde::{Deserialize, Serialize};

use super::PerformanceMonitor;
use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    WarmingUp,
    Healthy,
    Marginal,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHealth {
    pub model: String,
    pub status: HealthStatus,
    /// Rolling accuracy, `None` before the model has any outcome
    pub accuracy: Option<f64>,
    pub n_samples: usize,
    pub current_weight: Option<f64>,
    pub weight_trend: WeightTrend,
    pub recommendation: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModelHealthChecker {
    config: HealthConfig,
}

impl ModelHealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn check_model(&self, monitor: &PerformanceMonitor, model: &str) -> ModelHealth {
        let window = monitor.config().accuracy_window;
        let (accuracy, n_samples) = match monitor.model_accuracy(model, window) {
            Some((acc, n)) => (Some(acc), n),
            None => (None, 0),
        };

        let status = match accuracy {
            _ if n_samples < self.config.health_window => HealthStatus::WarmingUp,
            Some(acc) if acc >= self.config.healthy_threshold => HealthStatus::Healthy,
            Some(acc) if acc >= self.config.marginal_threshold => HealthStatus::Marginal,
            _ => HealthStatus::Unhealthy,
        };

        let series = monitor.weight_series(model);
        let weight_trend = self.weight_trend(&series);

        ModelHealth {
            model: model.to_string(),
            status,
            accuracy,
            n_samples,
            current_weight: series.last().copied(),
            weight_trend,
            recommendation: recommendation(status, weight_trend, n_samples, self.config.health_window),
        }
    }

    /// Health of every model the monitor has seen
    pub fn check_all(&self, monitor: &PerformanceMonitor) -> Vec<ModelHealth> {
        monitor
            .models()
            .iter()
            .map(|m| self.check_model(monitor, m))
            .collect()
    }

    /// Mean of the last `trend_window` weights against the ones before them.
    /// Short series split in half.
    pub fn weight_trend(&self, series: &[f64]) -> WeightTrend {
        let n = self.config.trend_window.min(series.len() / 2);
        if n == 0 {
            return WeightTrend::Stable;
        }
        let recent = &series[series.len() - n..];
        let prior = &series[series.len() - 2 * n..series.len() - n];
        let (Some(recent), Some(prior)) = (crate::stats::mean(recent), crate::stats::mean(prior))
        else {
            return WeightTrend::Stable;
        };

        let delta = recent - prior;
        if delta > self.config.trend_tolerance {
            WeightTrend::Increasing
        } else if delta < -self.config.trend_tolerance {
            WeightTrend::Decreasing
        } else {
            WeightTrend::Stable
        }
    }
}

fn recommendation(status: HealthStatus, trend: WeightTrend, n: usize, needed: usize) -> String {
    match (status, trend) {
        (HealthStatus::WarmingUp, _) => {
            format!("Collecting outcomes ({}/{}), no action yet", n, needed)
        }
        (HealthStatus::Healthy, WeightTrend::Decreasing) => {
            "Performing well but losing weight; check optimizer inputs".to_string()
        }
        (HealthStatus::Healthy, _) => "No action needed".to_string(),
        (HealthStatus::Marginal, WeightTrend::Increasing) => {
            "Marginal accuracy while gaining weight; review before next optimization".to_string()
        }
        (HealthStatus::Marginal, _) => "Monitor closely".to_string(),
        (HealthStatus::Unhealthy, _) => "Consider retraining or disabling this model".to_string(),
    }
}
