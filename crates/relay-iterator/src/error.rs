use thiserror::Error;

/// Errors that can occur within the iteration subsystem.
#[derive(Debug, Error)]
pub enum IteratorError {
    /// Underlying SQLite / rusqlite error. Retryable on the next tick.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A table or column name is not a plain SQL identifier.
    #[error("Invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// The id column of a claimed row holds neither an integer nor text.
    #[error("Unsupported id in column {column}: {reason}")]
    InvalidId { column: String, reason: String },

    /// Two iterators were registered under the same name.
    #[error("Iterator already registered: {name}")]
    DuplicateIterator { name: String },

    /// A configured value cannot be used (zero concurrency, zero interval, ...).
    #[error("Invalid iterator config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, IteratorError>;
