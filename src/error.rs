use thiserror::Error;

/// Failure taxonomy for the prediction engine.
///
/// Only `InvalidConfiguration` aborts a run. The other variants are absorbed
/// by the component that hits them and reported back through the result's
/// provenance.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("insufficient historical data for {dataset}: {available} match(es), need {required}")]
    InsufficientHistoricalData {
        dataset: String,
        available: usize,
        required: usize,
    },

    #[error("pattern database unavailable: {0}")]
    DatabaseUnavailable(String),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }

    pub fn insufficient(dataset: impl Into<String>, available: usize, required: usize) -> Self {
        EngineError::InsufficientHistoricalData {
            dataset: dataset.into(),
            available,
            required,
        }
    }

    /// True when the error must abort the run instead of degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::InvalidConfiguration(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::DatabaseUnavailable(format!("{:#}", err))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
