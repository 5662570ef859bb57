//! Walk-forward validation
//!
//! Runs a freshly built ensemble pipeline over sequential
//! train / validation / test windows with per-window hyperparameter search.

pub mod walk_forward;
#[cfg(test)]
mod tests;

pub use walk_forward::{
    divergence, BacktestReport, WalkForwardOptimizer, WindowConfig, WindowFailure, WindowResult,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ensemble::EnsembleManager;
use crate::error::{ForecastError, Result};
use crate::model::ParamSet;

/// Builds an untrained pipeline for one hyperparameter candidate
pub trait PipelineFactory: Send + Sync {
    fn build(&self, params: &ParamSet) -> Result<EnsembleManager>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&ParamSet) -> Result<EnsembleManager> + Send + Sync,
{
    fn build(&self, params: &ParamSet) -> Result<EnsembleManager> {
        self(params)
    }
}

/// Cooperative cancellation: a shared flag plus an optional deadline.
///
/// Clones share the flag, so cancelling one cancels all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// `Err(Cancelled)` once cancelled or past the deadline
    pub fn check(&self, context: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(ForecastError::Cancelled(context.to_string()));
        }
        Ok(())
    }
}

/// Cartesian product of a parameter search space.
///
/// Keys with no candidate values are left out; an empty space yields one
/// empty parameter set.
pub fn param_grid(space: &BTreeMap<String, Vec<f64>>) -> Vec<ParamSet> {
    let mut grid = vec![ParamSet::new()];
    for (key, values) in space {
        if values.is_empty() {
            continue;
        }
        grid = grid
            .into_iter()
            .flat_map(|base| {
                values.iter().map(move |v| {
                    let mut params = base.clone();
                    params.insert(key.clone(), *v);
                    params
                })
            })
            .collect();
    }
    grid
}
