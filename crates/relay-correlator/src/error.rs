use relay_core::error::code;
use thiserror::Error;

/// Errors that can occur while correlating task responses.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A response payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No terminal response was available when the wait ended.
    #[error("Task not completed: {task_id}")]
    TaskNotCompleted { task_id: String },

    /// The notify engine refused a delivery.
    #[error("Delivery failed for {correlation_id}: {reason}")]
    Delivery {
        correlation_id: String,
        reason: String,
    },
}

impl CorrelatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CorrelatorError::TaskNotCompleted { .. } => code::DEADLINE_EXCEEDED,
            _ => code::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, CorrelatorError>;
