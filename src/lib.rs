//! Ensemble Direction Forecasting
//!
//! Combines heterogeneous forecast models into one calibrated prediction,
//! validates pipelines walk-forward and monitors live accuracy.
//!
//! ## Architecture
//!
//! ```text
//! ForecastModel × N → EnsembleManager (weights, uncertainty, calibration) → ForecastResult
//!        ↑                      ↑                                              ↓
//!  RegimeDetector      WalkForwardOptimizer                          PerformanceMonitor → Alerts
//! ```

pub mod config;
pub mod ensemble;
pub mod error;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod regime;
pub mod stats;
pub mod testing;
pub mod types;
pub mod validation;

pub use error::{ForecastError, Result};

#[cfg(test)]
mod config_tests;
