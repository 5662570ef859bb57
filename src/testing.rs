//! Synthetic data and scripted models for tests, demos and the CLI

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::{ForecastError, Result};
use crate::model::{ForecastModel, ModelKind};
use crate::types::{ClassProbabilities, Direction, MarketFrame, ModelOutput, OhlcBar};

/// Parameters for [`synthetic_frame`]
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub rows: usize,
    pub seed: u64,
    pub start_price: f64,
    /// Mean daily return
    pub drift: f64,
    /// Daily return standard deviation
    pub volatility: f64,
    /// Correlation of feature column 1 with the forward return (0..1)
    pub signal_strength: f64,
    pub neutral_band: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rows: 250,
            seed: 7,
            start_price: 100.0,
            drift: 0.0003,
            volatility: 0.01,
            signal_strength: 0.3,
            neutral_band: 0.001,
        }
    }
}

/// Daily random-walk frame with labels, returns and two feature columns:
/// trailing 5-day return and a noisy view of the forward return.
pub fn synthetic_frame(cfg: &SyntheticConfig) -> MarketFrame {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let start: DateTime<Utc> = DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default();

    let mut prices = Vec::with_capacity(cfg.rows + 1);
    let mut price = cfg.start_price;
    prices.push(price);
    for _ in 0..cfg.rows {
        let ret = cfg.drift + cfg.volatility * rng.sample::<f64, _>(StandardNormal);
        price *= 1.0 + ret;
        prices.push(price.max(0.01));
    }

    let mut frame = MarketFrame::default();
    for i in 0..cfg.rows {
        let close = prices[i];
        let open = if i == 0 { close } else { prices[i - 1] };
        let range = cfg.volatility * close * (0.5 + rng.random::<f64>());
        frame.bars.push(OhlcBar {
            timestamp: start + Duration::days(i as i64),
            open,
            high: open.max(close) + range / 2.0,
            low: (open.min(close) - range / 2.0).max(0.001),
            close,
            volume: 1_000_000.0 * (0.5 + rng.random::<f64>()),
        });

        let forward = prices[i + 1] / close - 1.0;
        let trailing = if i >= 5 { close / prices[i - 5] - 1.0 } else { 0.0 };
        let noise = cfg.volatility * rng.sample::<f64, _>(StandardNormal);
        let s = cfg.signal_strength.clamp(0.0, 1.0);
        let informative = s * forward + (1.0 - s) * noise;

        frame.features.push(vec![trailing, informative]);
        frame.returns.push(forward);
        frame.labels.push(Direction::from_return(forward, cfg.neutral_band));
    }
    frame
}

type Script = Box<dyn Fn(&MarketFrame) -> Result<ModelOutput> + Send + Sync>;

/// Test double whose prediction is a closure over the input frame
pub struct ScriptedModel {
    name: String,
    kind: ModelKind,
    fail_train: bool,
    script: Script,
}

impl ScriptedModel {
    pub fn from_fn<F>(name: &str, f: F) -> Self
    where
        F: Fn(&MarketFrame) -> Result<ModelOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind: ModelKind::Baseline,
            fail_train: false,
            script: Box::new(f),
        }
    }

    /// Always returns `output`
    pub fn fixed(name: &str, output: ModelOutput) -> Self {
        Self::from_fn(name, move |_| Ok(output.clone()))
    }

    /// Trains fine, raises on every predict
    pub fn failing_predict(name: &str) -> Self {
        let owned = name.to_string();
        Self::from_fn(name, move |_| {
            Err(ForecastError::model_failure(&owned, "predict", "scripted failure"))
        })
    }

    /// Raises on train
    pub fn failing_train(name: &str) -> Self {
        let mut model = Self::fixed(name, ModelOutput::directional(ClassProbabilities::uniform()));
        model.fail_train = true;
        model
    }

    /// Predicts the realized label of the frame's last row, read from `truth`
    pub fn oracle(name: &str, truth: &MarketFrame) -> Self {
        let truth = truth.clone();
        Self::from_fn(name, move |frame| Ok(labelled_output(&truth, frame.len(), false)))
    }

    /// Predicts the opposite of what [`ScriptedModel::oracle`] would
    pub fn contrarian(name: &str, truth: &MarketFrame) -> Self {
        let truth = truth.clone();
        Self::from_fn(name, move |frame| Ok(labelled_output(&truth, frame.len(), true)))
    }

    pub fn with_kind(mut self, kind: ModelKind) -> Self {
        self.kind = kind;
        self
    }
}

fn labelled_output(truth: &MarketFrame, rows: usize, invert: bool) -> ModelOutput {
    let idx = rows.saturating_sub(1);
    let label = truth.labels.get(idx).copied().unwrap_or(Direction::Neutral);
    let label = if invert {
        Direction::from_signed(-label.signed())
    } else {
        label
    };
    let mut probabilities = ClassProbabilities::new(0.1, 0.1, 0.1);
    probabilities.set(label, 0.8);
    let ret = truth.returns.get(idx).copied().unwrap_or(0.0);
    let ret = if invert { -ret } else { ret };
    ModelOutput::directional(probabilities).with_return(ret, 0.01)
}

impl ForecastModel for ScriptedModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ModelKind {
        self.kind
    }

    fn train(&mut self, _frame: &MarketFrame) -> Result<()> {
        if self.fail_train {
            return Err(ForecastError::model_failure(&self.name, "train", "scripted failure"));
        }
        Ok(())
    }

    fn predict(&self, frame: &MarketFrame) -> Result<ModelOutput> {
        (self.script)(frame)
    }
}
