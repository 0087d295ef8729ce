use relay_core::error::code;
use relay_correlator::CorrelatorError;
use thiserror::Error;

/// Errors returned to dispatch callers, each mapped to one wire status.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Missing or malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No agent group satisfies the task's capabilities.
    #[error("No eligible agent for capabilities [{capabilities}]")]
    NoEligibleAgent { capabilities: String },

    /// The referenced infra was never set up (or its setup failed).
    #[error("Unknown infra: {infra_id}")]
    UnknownInfra { infra_id: String },

    /// The auxiliary token could not be read.
    #[error("Token unavailable: {0}")]
    Token(#[source] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Response store error: {0}")]
    Correlator(#[from] CorrelatorError),

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Status code string sent to clients in RES frames.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => code::INVALID_ARGUMENT,
            DispatchError::NoEligibleAgent { .. } | DispatchError::UnknownInfra { .. } => {
                code::FAILED_PRECONDITION
            }
            DispatchError::Unimplemented(_) => code::UNIMPLEMENTED,
            DispatchError::Token(_)
            | DispatchError::Database(_)
            | DispatchError::Serialization(_)
            | DispatchError::Correlator(_)
            | DispatchError::Internal(_) => code::INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
