use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("remote inference error [{code}]: {message}")]
    Remote { code: String, message: String },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("corrupt payload: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the queue runtime should retry a job that failed with this
    /// error. Disk and network hiccups, remote errors, and timeouts earn
    /// another attempt; missing inputs and policy violations do not.
    /// Corrupt responses count as remote failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Io(_)
                | CoreError::Remote { .. }
                | CoreError::Cancelled(_)
                | CoreError::Corrupt(_)
                | CoreError::Database(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
