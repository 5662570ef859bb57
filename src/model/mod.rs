//! Forecast models consumed by the ensemble
//!
//! Every model variant implements [`ForecastModel`]; the ensemble never looks
//! past this contract. Fitting internals of the production variants (tree
//! ensembles, ARIMA-GARCH, Prophet, LSTM) live outside this crate. The
//! [`reference`] module ships small baselines used by the CLI and tests.

pub mod reference;
#[cfg(test)]
mod tests;

pub use reference::{DriftModel, SignalKind, SignalModel};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{MarketFrame, ModelOutput};

/// Hyperparameters by name
pub type ParamSet = BTreeMap<String, f64>;

/// Read a parameter, falling back to `default`
pub fn param(params: &ParamSet, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .copied()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Model family, used to enable or disable variants from config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Gradient-boosted tree ensemble
    GradientBoosting,
    /// Bagged tree ensemble
    RandomForest,
    ArimaGarch,
    Prophet,
    Lstm,
    /// Simple statistical baseline
    Baseline,
}

/// Trait for forecast models
pub trait ForecastModel: Send {
    /// Model name for logging and weight keys
    fn name(&self) -> &str;

    fn kind(&self) -> ModelKind;

    /// Fit on a labelled frame
    fn train(&mut self, frame: &MarketFrame) -> Result<()>;

    /// Forecast the horizon following the last row of `frame`
    fn predict(&self, frame: &MarketFrame) -> Result<ModelOutput>;
}

impl std::fmt::Debug for dyn ForecastModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForecastModel")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
