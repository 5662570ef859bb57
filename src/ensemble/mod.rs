//! Ensemble aggregation
//!
//! - [`weights`]: learns combination weights from prediction history
//! - [`uncertainty`]: aggregates forecasts and calibrates intervals
//! - [`manager`]: ties models, weights and calibration together

pub mod manager;
pub mod uncertainty;
pub mod weights;

pub use manager::{EnsembleManager, ForecastRow, WeightSnapshot, WeightUpdate};
pub use uncertainty::{
    CalibrationRecord, EnsembleForecast, ProbabilityAggregate, UncertaintyQuantifier,
};
pub use weights::{AdaptiveWeightOptimizer, OptimizationMethod, WeightOptimizer};
