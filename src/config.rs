//! Engine configuration
//!
//! Every section deserializes with defaults, so an empty file is a valid
//! configuration. `Config::load` layers a TOML file with `ENSEMBLE__*`
//! environment variables and validates the result before returning it.

use serde::{Deserialize, Serialize};

use crate::ensemble::OptimizationMethod;
use crate::error::{ForecastError, Result};
use crate::model::ModelKind;
use crate::regime::RegimeConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ensemble: EnsembleConfig,
    pub uncertainty: UncertaintyConfig,
    pub weights: WeightOptimizerConfig,
    pub walk_forward: WalkForwardConfig,
    pub monitor: MonitorConfig,
    pub health: HealthConfig,
    pub regime: RegimeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Model families allowed to train and predict
    pub enabled_models: Vec<ModelKind>,
    /// Trailing rows replayed by `optimize_weights`
    pub optimization_window: usize,
    pub optimization_method: OptimizationMethod,
    /// Learn and apply one weight vector per market regime
    pub regime_aware: bool,
    /// Calibration key used for the ensemble interval
    pub calibration_key: String,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            enabled_models: vec![
                ModelKind::GradientBoosting,
                ModelKind::RandomForest,
                ModelKind::ArimaGarch,
                ModelKind::Prophet,
                ModelKind::Lstm,
                ModelKind::Baseline,
            ],
            optimization_window: 100,
            optimization_method: OptimizationMethod::Nnls,
            regime_aware: false,
            calibration_key: "ensemble".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UncertaintyConfig {
    /// Target interval coverage, also sets the z multiplier
    pub confidence_level: f64,
    pub min_samples_for_calibration: usize,
    /// Lower bound applied to calibration ratios before scaling
    pub min_calibration_ratio: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            min_samples_for_calibration: 30,
            min_calibration_ratio: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightOptimizerConfig {
    /// Models with fewer usable samples get zero weight
    pub min_samples: usize,
    /// Samples a regime needs before it gets its own vector
    pub min_regime_samples: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for WeightOptimizerConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            min_regime_samples: 20,
            max_iterations: 500,
            tolerance: 1e-10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub train_days: usize,
    pub val_days: usize,
    pub test_days: usize,
    pub step_days: usize,
    /// Time-series folds inside the training slice
    pub n_folds: usize,
    /// Smallest fold before falling back to the validation slice
    pub min_fold_size: usize,
    /// Relative val/test RMSE gap flagged as overfitting
    pub divergence_threshold: f64,
    /// Concurrent windows in `run_backtest_concurrent`
    pub max_workers: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_days: 120,
            val_days: 30,
            test_days: 30,
            step_days: 30,
            n_folds: 3,
            min_fold_size: 10,
            divergence_threshold: 0.20,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub accuracy_window: usize,
    pub min_samples_for_alert: usize,
    pub low_accuracy_threshold: f64,
    pub model_degradation_threshold: f64,
    /// Drop between consecutive `drop_window` blocks that is critical
    pub accuracy_drop_threshold: f64,
    pub drop_window: usize,
    pub calibration_drift_tolerance: f64,
    pub ece_threshold: f64,
    /// Same alert is suppressed for this long after it fires
    pub alert_cooldown_secs: i64,
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            accuracy_window: 50,
            min_samples_for_alert: 20,
            low_accuracy_threshold: 0.45,
            model_degradation_threshold: 0.40,
            accuracy_drop_threshold: 0.15,
            drop_window: 10,
            calibration_drift_tolerance: 0.10,
            ece_threshold: 0.10,
            alert_cooldown_secs: 3600,
            max_alerts: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Samples a model needs before it leaves warm-up
    pub health_window: usize,
    pub healthy_threshold: f64,
    pub marginal_threshold: f64,
    /// Snapshots per side when comparing weight trends
    pub trend_window: usize,
    pub trend_tolerance: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            health_window: 20,
            healthy_threshold: 0.55,
            marginal_threshold: 0.45,
            trend_window: 5,
            trend_tolerance: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file (optional) plus `ENSEMBLE__SECTION__KEY` overrides
    pub fn load(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("ENSEMBLE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ForecastError::Configuration(msg));

        let cl = self.uncertainty.confidence_level;
        if cl.is_nan() || cl <= 0.0 || cl >= 1.0 {
            return fail(format!("uncertainty.confidence_level {} must be in (0, 1)", cl));
        }
        if self.uncertainty.min_samples_for_calibration == 0 {
            return fail("uncertainty.min_samples_for_calibration must be > 0".to_string());
        }
        let floor = self.uncertainty.min_calibration_ratio;
        if floor.is_nan() || floor <= 0.0 {
            return fail("uncertainty.min_calibration_ratio must be > 0".to_string());
        }
        if self.weights.min_samples == 0 {
            return fail("weights.min_samples must be > 0".to_string());
        }
        if self.ensemble.optimization_window < self.weights.min_samples {
            return fail(format!(
                "ensemble.optimization_window {} is below weights.min_samples {}",
                self.ensemble.optimization_window, self.weights.min_samples
            ));
        }

        let wf = &self.walk_forward;
        if wf.train_days < 2 || wf.val_days < 2 || wf.test_days < 2 {
            return fail("walk_forward train/val/test days must each be >= 2".to_string());
        }
        if wf.step_days == 0 {
            return fail("walk_forward.step_days must be > 0".to_string());
        }
        if wf.n_folds == 0 {
            return fail("walk_forward.n_folds must be > 0".to_string());
        }
        if wf.divergence_threshold < 0.0 {
            return fail("walk_forward.divergence_threshold must be >= 0".to_string());
        }

        let m = &self.monitor;
        if m.accuracy_window < 2 {
            return fail("monitor.accuracy_window must be >= 2".to_string());
        }
        if m.alert_cooldown_secs < 0 {
            return fail("monitor.alert_cooldown_secs must be >= 0".to_string());
        }
        for (name, v) in [
            ("low_accuracy_threshold", m.low_accuracy_threshold),
            ("model_degradation_threshold", m.model_degradation_threshold),
            ("accuracy_drop_threshold", m.accuracy_drop_threshold),
            ("ece_threshold", m.ece_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return fail(format!("monitor.{} {} must be in [0, 1]", name, v));
            }
        }

        let h = &self.health;
        if h.marginal_threshold > h.healthy_threshold {
            return fail("health.marginal_threshold must not exceed healthy_threshold".to_string());
        }
        if h.trend_window == 0 {
            return fail("health.trend_window must be > 0".to_string());
        }
        Ok(())
    }

    /// JSON snapshot for export
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
