use thiserror::Error;

/// Failures surfaced by the adaptive EKF.
///
/// None of these are fatal to the sampling loop: the filter either skipped the
/// step or already restored itself before returning.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Non-finite input rejected: {0}")]
    InvalidInput(String),

    #[error("Innovation covariance is singular, update skipped")]
    SingularInnovation,

    #[error("Numerical instability recovered: {0}")]
    NumericalInstability(String),
}

/// Configuration validation / loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid parameter {parameter}: {message}")]
    InvalidParameter {
        parameter: &'static str,
        message: String,
    },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for filter operations
pub type FilterResult<T> = Result<T, FilterError>;
