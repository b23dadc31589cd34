//! Error handling for the inference worker
//!
//! Provides a unified error type and result type shared by the pool, the
//! dispatcher, the offline pipeline and the backends.

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the worker
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed variant, instance name or address
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Concurrent operation on the same instance or job
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No port or core left to hand out
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Backend process did not start or never became ready
    #[error("Launch failure: {0}")]
    LaunchFailure(String),

    /// Metadata store, object storage or backend RPC failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Pool and port table disagree
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// Backend kind or protocol not supported for the requested operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Create a launch failure
    pub fn launch_failure(msg: impl Into<String>) -> Self {
        Self::LaunchFailure(msg.into())
    }

    /// Create an upstream failure
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an inconsistent state error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Create an unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Timeout(_) | Error::ResourceExhausted(_) | Error::Io(_)
        )
    }

    /// Check if this error indicates a client-side problem
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_)
                | Error::InvalidConfiguration(_)
                | Error::Conflict(_)
                | Error::Unsupported(_)
        )
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Conflict(_) => "conflict",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::LaunchFailure(_) => "launch_failure",
            Error::Upstream(_) => "upstream",
            Error::Timeout(_) => "timeout",
            Error::Inconsistent(_) => "inconsistent",
            Error::Unsupported(_) => "unsupported",
            Error::Cancelled(_) => "cancelled",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) | Error::InvalidConfiguration(_) => 400,
            Error::Conflict(_) => 409,
            Error::Timeout(_) => 504,
            Error::ResourceExhausted(_) => 503,
            Error::Upstream(_) | Error::LaunchFailure(_) => 502,
            Error::Unsupported(_) => 501,
            Error::Cancelled(_) => 499,
            _ => 500,
        }
    }
}

/// Extension trait for adding context to Results
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    /// Add context to an error using a closure
    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", context.into(), original_error))
        })
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original_error = e.into();
            Error::Other(anyhow::anyhow!("{}: {}", f(), original_error))
        })
    }
}
