//! Explicit error kinds for the reason-act loop, replacing the exception-based
//! control flow of the source this engine was distilled from. The executor
//! matches on these kinds directly instead of catching broad exception types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model transport error: {0}")]
    ModelTransport(String),

    #[error("unexpected model response shape: {0}")]
    ModelShape(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("invalid arguments for tool {tool_name}: {message}")]
    ToolArgumentError { tool_name: String, message: String },

    #[error("tool transport error for {tool_name}: {message}")]
    ToolTransport { tool_name: String, message: String },

    #[error("tool {tool_name} timed out")]
    ToolTimeout { tool_name: String },

    #[error("sensitive value lookup missed: {0}")]
    SensitiveLookupMiss(String),

    #[error("persistence error (non-fatal): {0}")]
    PersistenceTransient(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for sa_domain::Error {
    fn from(e: EngineError) -> Self {
        sa_domain::Error::Other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
