//! Error types for the range relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while relaying a ranged request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Range not satisfiable: {0}")]
    RangeUnsatisfiable(String),

    #[error("Retry budget exhausted after {attempts} failed fetches (max {max_retries})")]
    RetryBudgetExhausted { attempts: u32, max_retries: u32 },

    #[error("Backend returned status {status}")]
    BackendError { status: u16 },

    #[error("Short delivery: {delivered} of {expected} bytes relayed")]
    ShortDelivery { delivered: u64, expected: u64 },

    #[error("Backend body starts at byte {actual}, expected {expected}")]
    MisalignedBody { expected: u64, actual: u64 },

    #[error("Redirect target missing: {0}")]
    RedirectTargetMissing(String),

    #[error("Redirect limit exceeded after {hops} hops")]
    RedirectLimitExceeded { hops: u32 },

    #[error("Inconsistent relay state: {0}")]
    InconsistentState(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::IoError(err.to_string())
    }
}

impl RelayError {
    /// Determine if this error is recovered locally by dispatching another fetch
    ///
    /// Returns true for conditions the orchestrator absorbs within the retry budget:
    /// - error statuses from the backend
    /// - short deliveries (resumed from the current offset)
    /// - bodies starting past the offset owed to the client
    /// - transport failures talking to the backend
    ///
    /// Everything else is terminal for the client request.
    pub fn should_retry(&self) -> bool {
        match self {
            RelayError::BackendError { .. } => true,
            RelayError::ShortDelivery { .. } => true,
            RelayError::MisalignedBody { .. } => true,
            RelayError::HttpError(_) => true,
            RelayError::IoError(_) => true,

            RelayError::ConfigError(_) => false,
            RelayError::RangeUnsatisfiable(_) => false,
            RelayError::RetryBudgetExhausted { .. } => false,
            RelayError::RedirectTargetMissing(_) => false,
            RelayError::RedirectLimitExceeded { .. } => false,
            RelayError::InconsistentState(_) => false,
            RelayError::ParseError(_) => false,
            RelayError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status presented to the client
    ///
    /// Malformed or multipart ranges map to 416; every other terminal
    /// condition is a server error.
    pub fn to_http_status(&self) -> u16 {
        match self {
            RelayError::RangeUnsatisfiable(_) => 416,
            _ => 500,
        }
    }

    /// Create an error from a backend HTTP status code
    pub fn from_http_status(status: u16) -> Self {
        RelayError::BackendError { status }
    }

    /// Shorthand for a `RangeUnsatisfiable` error
    pub fn unsatisfiable(message: impl Into<String>) -> Self {
        RelayError::RangeUnsatisfiable(message.into())
    }
}
