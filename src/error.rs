use thiserror::Error;

/// Errors raised while configuring or running a batch import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store error: {0}")]
    Store(String),
    #[error("unsupported value: {0}")]
    Unsupported(String),
}

impl ImportError {
    pub fn config(message: impl Into<String>) -> Self {
        ImportError::Config(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        ImportError::Precondition(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        ImportError::Store(message.into())
    }

    /// True for errors caused by the caller's setup rather than by I/O.
    pub fn is_config(&self) -> bool {
        matches!(self, ImportError::Config(_))
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
