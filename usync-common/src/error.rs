use thiserror::Error;

/// The stable error kinds surfaced by the core, per the error handling
/// design in the specification. Component-internal helpers may compose
/// several fallible steps behind `anyhow::Result`, but anything crossing
/// a component boundary described in the control surface or the §7 error
/// table is reported as one of these variants so callers can match on
/// the kind rather than parse a message.
#[derive(Debug, Error)]
pub enum UsyncError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied")]
    AccessDenied,

    #[error("share expired")]
    Expired,

    #[error("integrity check failed: {0}")]
    IntegrityFailed(String),

    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    #[error("fatal provider error: {0}")]
    ProviderFatal(String),

    #[error("secure storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("already initialized")]
    AlreadyInitialized,
}

impl UsyncError {
    /// Whether the caller should retry the operation that produced this
    /// error, or whether it is terminal. `ProviderTransient` is the only
    /// variant that is retryable on its own; the retry driver in
    /// `usync-nntp` decides attempt counts and backoff, this just answers
    /// "is retrying ever worthwhile".
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsyncError::ProviderTransient(_))
    }
}

impl From<std::io::Error> for UsyncError {
    fn from(err: std::io::Error) -> Self {
        UsyncError::StorageUnavailable(err.to_string())
    }
}
