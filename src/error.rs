use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure to load or render a target page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NavigationError {
    /// Worth retrying: timeouts, flaky network, throttling, bot challenges.
    #[error("transient navigation failure: {0}")]
    Transient(String),

    /// Retrying cannot help: DNS failure, 4xx on the target, bad URL.
    #[error("permanent navigation failure: {0}")]
    Permanent(String),
}

impl NavigationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, NavigationError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference timed out")]
    Timeout,

    #[error("malformed inference response: {0}")]
    Malformed(String),

    #[error("inference refused: {0}")]
    Refused(String),

    /// Provider throttled or failed; retried like a timeout.
    #[error("inference provider unavailable: {0}")]
    Unavailable(String),

    #[error("tenant budget exceeded")]
    BudgetExceeded,

    /// The ledger could not authorize or record the call.
    #[error("inference usage could not be metered: {0}")]
    Unmetered(#[source] StorageError),
}

impl InferenceError {
    /// Failures retried locally with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InferenceError::Timeout | InferenceError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// The pattern did not yield sane, complete records on this page.
    #[error("pattern failed validation: {0}")]
    ValidationFailed(String),

    #[error("no records could be extracted")]
    EmptyResult,
}

/// Why a single target URL produced no records.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Navigation(#[from] NavigationError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    #[error("output error: {0}")]
    Output(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Output(e.to_string())
    }
}

impl From<csv::Error> for StorageError {
    fn from(e: csv::Error) -> Self {
        StorageError::Output(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}
