//! Error types for the forecasting engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    /// A single model raised during train or predict
    #[error("model {model} failed during {operation}: {reason}")]
    ModelFailure {
        model: String,
        operation: String,
        reason: String,
    },

    /// No model produced a usable forecast
    #[error("aggregation failed: {0}")]
    AggregationFailure(String),

    #[error("insufficient data for {context}: need {required}, have {available}")]
    InsufficientData {
        context: String,
        required: usize,
        available: usize,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// A model returned a payload that breaks the output contract
    #[error("invalid output from {model}: {reason}")]
    InvalidOutput { model: String, reason: String },

    #[error("no trained models available")]
    NotTrained,

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config load error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForecastError {
    pub fn model_failure(model: &str, operation: &str, reason: impl ToString) -> Self {
        ForecastError::ModelFailure {
            model: model.to_string(),
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn insufficient(context: &str, required: usize, available: usize) -> Self {
        ForecastError::InsufficientData {
            context: context.to_string(),
            required,
            available,
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
