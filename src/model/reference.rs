//! Baseline forecasters
//!
//! These implement [`ForecastModel`] with deliberately simple statistics so the
//! ensemble, walk-forward and monitoring layers can run end to end without the
//! external production models.

use crate::error::{ForecastError, Result};
use crate::model::{param, ForecastModel, ModelKind, ParamSet};
use crate::stats;
use crate::types::{ClassProbabilities, Direction, MarketFrame, ModelOutput};

/// Returns within this band count as neutral
pub const DEFAULT_NEUTRAL_BAND: f64 = 0.001;

/// Convert a Gaussian return forecast into class probabilities
pub fn gaussian_class_probabilities(mean: f64, sigma: f64, neutral_band: f64) -> ClassProbabilities {
    if !sigma.is_finite() || sigma <= f64::EPSILON {
        return ClassProbabilities::certain(Direction::from_return(mean, neutral_band));
    }
    let p_up = 1.0 - stats::normal_cdf((neutral_band - mean) / sigma);
    let p_down = stats::normal_cdf((-neutral_band - mean) / sigma);
    let p_neutral = (1.0 - p_up - p_down).max(0.0);
    ClassProbabilities::new(p_up, p_neutral, p_down).normalized()
}

fn gaussian_output(mean: f64, sigma: f64, neutral_band: f64) -> ModelOutput {
    let probabilities = gaussian_class_probabilities(mean, sigma, neutral_band);
    let half_width = 1.96 * sigma;
    ModelOutput::directional(probabilities)
        .with_return(mean, sigma)
        .with_interval(mean - half_width, mean + half_width)
}

/// Forecasts the trailing mean return with the trailing standard deviation
#[derive(Debug, Clone)]
pub struct DriftModel {
    name: String,
    lookback: usize,
    neutral_band: f64,
    fitted: Option<(f64, f64)>,
}

impl DriftModel {
    pub fn new(name: &str, lookback: usize) -> Self {
        Self {
            name: name.to_string(),
            lookback: lookback.max(2),
            neutral_band: DEFAULT_NEUTRAL_BAND,
            fitted: None,
        }
    }

    /// Reads `lookback` and `neutral_band`
    pub fn from_params(name: &str, params: &ParamSet) -> Self {
        let mut model = Self::new(name, param(params, "lookback", 20.0).max(2.0) as usize);
        model.neutral_band = param(params, "neutral_band", DEFAULT_NEUTRAL_BAND).max(0.0);
        model
    }
}

impl ForecastModel for DriftModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Baseline
    }

    fn train(&mut self, frame: &MarketFrame) -> Result<()> {
        if !frame.has_returns() {
            return Err(ForecastError::model_failure(&self.name, "train", "frame has no returns"));
        }
        let window = stats::tail(&frame.returns, self.lookback);
        let finite: Vec<f64> = window.iter().copied().filter(|r| r.is_finite()).collect();
        if finite.len() < 2 {
            return Err(ForecastError::insufficient("drift fit", 2, finite.len()));
        }
        let mean = stats::mean(&finite).unwrap_or(0.0);
        let sigma = stats::std_dev(&finite).unwrap_or(0.0);
        self.fitted = Some((mean, sigma));
        Ok(())
    }

    fn predict(&self, _frame: &MarketFrame) -> Result<ModelOutput> {
        let (mean, sigma) = self
            .fitted
            .ok_or_else(|| ForecastError::model_failure(&self.name, "predict", "model not trained"))?;
        Ok(gaussian_output(mean, sigma, self.neutral_band))
    }
}

/// Which trailing signal a [`SignalModel`] regresses forward returns on
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalKind {
    /// close[t] / close[t - lookback] - 1
    Momentum,
    /// (close[t] - SMA) / SMA over `lookback`
    MeanReversion,
    /// A raw feature column
    Feature(usize),
}

/// One-factor linear forecaster: forward return = alpha + beta * signal
#[derive(Debug, Clone)]
pub struct SignalModel {
    name: String,
    signal: SignalKind,
    lookback: usize,
    neutral_band: f64,
    ridge: f64,
    fitted: Option<LinearFit>,
}

#[derive(Debug, Clone, Copy)]
struct LinearFit {
    alpha: f64,
    beta: f64,
    residual_sigma: f64,
}

impl SignalModel {
    pub fn new(name: &str, signal: SignalKind, lookback: usize) -> Self {
        Self {
            name: name.to_string(),
            signal,
            lookback: lookback.max(1),
            neutral_band: DEFAULT_NEUTRAL_BAND,
            ridge: 0.0,
            fitted: None,
        }
    }

    pub fn momentum(name: &str, lookback: usize) -> Self {
        Self::new(name, SignalKind::Momentum, lookback)
    }

    pub fn mean_reversion(name: &str, lookback: usize) -> Self {
        Self::new(name, SignalKind::MeanReversion, lookback)
    }

    /// Reads `lookback`, `ridge` and `neutral_band`
    pub fn from_params(name: &str, signal: SignalKind, params: &ParamSet) -> Self {
        let mut model = Self::new(name, signal, param(params, "lookback", 10.0).max(1.0) as usize);
        model.ridge = param(params, "ridge", 0.0).max(0.0);
        model.neutral_band = param(params, "neutral_band", DEFAULT_NEUTRAL_BAND).max(0.0);
        model
    }

    /// Signal value at row `idx`, `None` without enough history
    fn signal_at(&self, frame: &MarketFrame, idx: usize) -> Option<f64> {
        let value = match self.signal {
            SignalKind::Momentum => {
                if idx < self.lookback {
                    return None;
                }
                let past = frame.bars[idx - self.lookback].close;
                if past <= 0.0 {
                    return None;
                }
                frame.bars[idx].close / past - 1.0
            }
            SignalKind::MeanReversion => {
                if idx + 1 < self.lookback {
                    return None;
                }
                let window = &frame.bars[idx + 1 - self.lookback..=idx];
                let sma = window.iter().map(|b| b.close).sum::<f64>() / window.len() as f64;
                if sma <= 0.0 {
                    return None;
                }
                (frame.bars[idx].close - sma) / sma
            }
            SignalKind::Feature(col) => *frame.features.get(idx)?.get(col)?,
        };
        value.is_finite().then_some(value)
    }
}

impl ForecastModel for SignalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModelKind {
        ModelKind::Baseline
    }

    fn train(&mut self, frame: &MarketFrame) -> Result<()> {
        if !frame.has_returns() {
            return Err(ForecastError::model_failure(&self.name, "train", "frame has no returns"));
        }

        let (xs, ys): (Vec<f64>, Vec<f64>) = (0..frame.len())
            .filter_map(|i| {
                let x = self.signal_at(frame, i)?;
                let y = frame.returns[i];
                y.is_finite().then_some((x, y))
            })
            .unzip();

        if xs.len() < 3 {
            return Err(ForecastError::insufficient("signal regression", 3, xs.len()));
        }

        let mx = stats::mean(&xs).unwrap_or(0.0);
        let my = stats::mean(&ys).unwrap_or(0.0);
        let sxx: f64 = xs.iter().map(|x| (x - mx).powi(2)).sum();
        let sxy: f64 = xs.iter().zip(&ys).map(|(x, y)| (x - mx) * (y - my)).sum();
        let beta = if sxx + self.ridge > f64::EPSILON {
            sxy / (sxx + self.ridge)
        } else {
            0.0
        };
        let alpha = my - beta * mx;

        let residuals: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| y - (alpha + beta * x))
            .collect();
        let residual_sigma = stats::std_dev(&residuals).unwrap_or(0.0);

        self.fitted = Some(LinearFit {
            alpha,
            beta,
            residual_sigma,
        });
        Ok(())
    }

    fn predict(&self, frame: &MarketFrame) -> Result<ModelOutput> {
        let fit = self
            .fitted
            .ok_or_else(|| ForecastError::model_failure(&self.name, "predict", "model not trained"))?;
        let last = frame
            .len()
            .checked_sub(1)
            .ok_or_else(|| ForecastError::model_failure(&self.name, "predict", "empty frame"))?;
        let signal = self.signal_at(frame, last).ok_or_else(|| {
            ForecastError::model_failure(&self.name, "predict", "not enough history for signal")
        })?;
        let mean = fit.alpha + fit.beta * signal;
        Ok(gaussian_output(mean, fit.residual_sigma, self.neutral_band))
    }
}
