use thiserror::Error;

/// Main error type for the sweep system
#[derive(Error, Debug)]
pub enum HpoError {
    #[error("Distribution error: {0}")]
    Distribution(#[from] DistributionError),

    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised while parsing or validating search-space distributions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DistributionError {
    #[error("Malformed distribution argument '{argument}': {message}")]
    Malformed { argument: String, message: String },

    #[error("Invalid bounds for '{name}': low {low}, high {high}")]
    InvalidBounds { name: String, low: f64, high: f64 },

    #[error("Categorical distribution '{name}' has no choices")]
    EmptyChoices { name: String },
}

/// Sweep and trial consistency errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("Invalid sweep configuration for '{sweep_id}': {message}")]
    Configuration { sweep_id: String, message: String },

    #[error("Unknown trial {trial_index} in sweep '{sweep_id}'")]
    UnknownTrial { sweep_id: String, trial_index: usize },

    #[error("Sweep not found: {sweep_id}")]
    NotFound { sweep_id: String },

    #[error("Sweep '{sweep_id}' is running and cannot be replaced")]
    AlreadyRunning { sweep_id: String },
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Stale snapshot for '{sweep_id}': read revision {expected}, store is at {actual}")]
    StaleSnapshot {
        sweep_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Storage backend failure: {message}")]
    Backend { message: String },

    #[error("Corrupt record for '{key}': {message}")]
    Corruption { key: String, message: String },
}

/// Result type alias for sweep operations
pub type HpoResult<T> = Result<T, HpoError>;

impl HpoError {
    /// Shorthand for a [`SweepError::Configuration`] wrapped in `HpoError`.
    pub fn configuration(sweep_id: impl Into<String>, message: impl Into<String>) -> Self {
        SweepError::Configuration {
            sweep_id: sweep_id.into(),
            message: message.into(),
        }
        .into()
    }

    /// Shorthand for a [`DistributionError::Malformed`] wrapped in `HpoError`.
    pub fn malformed(argument: impl Into<String>, message: impl Into<String>) -> Self {
        DistributionError::Malformed {
            argument: argument.into(),
            message: message.into(),
        }
        .into()
    }

    /// True when the failure is an optimistic-concurrency conflict that the
    /// caller may resolve by re-reading on the next tick.
    pub fn is_stale_snapshot(&self) -> bool {
        matches!(self, HpoError::Store(StoreError::StaleSnapshot { .. }))
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HpoError::Validation(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HpoError::Config(format!($($arg)*))
    };
}
