use std::error::Error as StdError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BacktestError>;

/// Errors reported by the catalog, scorer and backtest engine.
///
/// None of these are retried by the engine itself; a failed run never yields
/// a partial result.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("insufficient price history for {stock_code}: {available} bars, at least {required} required")]
    InsufficientData {
        stock_code: String,
        available: usize,
        required: usize,
    },

    #[error("data access failed while {context}: {source}")]
    DataAccess {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
}

impl BacktestError {
    pub fn data_access<C, E>(context: C, source: E) -> Self
    where
        C: Into<String>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        BacktestError::DataAccess {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn invalid<S: Into<String>>(message: S) -> Self {
        BacktestError::InvalidConfiguration(message.into())
    }

    pub fn not_found<S: Into<String>>(entity: &'static str, key: S) -> Self {
        BacktestError::NotFound {
            entity,
            key: key.into(),
        }
    }
}
