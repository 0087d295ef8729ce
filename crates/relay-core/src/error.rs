use thiserror::Error;

/// Wire status codes shared by every RPC error.
pub mod code {
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const FAILED_PRECONDITION: &str = "FAILED_PRECONDITION";
    pub const INTERNAL: &str = "INTERNAL";
    pub const UNIMPLEMENTED: &str = "UNIMPLEMENTED";
    pub const DEADLINE_EXCEEDED: &str = "DEADLINE_EXCEEDED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Short error code string sent to clients in RES frames.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Config(_) | RelayError::InvalidArgument(_) => code::INVALID_ARGUMENT,
            RelayError::MethodNotFound { .. } => code::METHOD_NOT_FOUND,
            RelayError::Timeout { .. } => code::DEADLINE_EXCEEDED,
            RelayError::Database(_)
            | RelayError::Serialization(_)
            | RelayError::Io(_)
            | RelayError::Internal(_) => code::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
