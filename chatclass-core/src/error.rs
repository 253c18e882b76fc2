//! Error types for chatclass-core

use thiserror::Error;

/// Main error type for the chatclass-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A stored row could not be decoded
    #[error("parse error in {entity}: {message}")]
    Parse { entity: String, message: String },

    /// Rate limiting, timeouts, 5xx responses
    #[error("transient classifier failure: {0}")]
    Transient(String),

    /// The model produced output that does not match the expected schema
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The model endpoint refused this particular request (too large, invalid input)
    #[error("request rejected by model endpoint: {0}")]
    Rejected(String),

    /// Authentication or configuration problem at the model endpoint
    #[error("fatal classifier failure: {0}")]
    Fatal(String),

    /// Transient failures persisted past the retry budget
    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    /// Instruction text could not be loaded
    #[error("instructions error: {0}")]
    Instructions(String),
}

impl Error {
    /// Whether a retry with backoff may succeed.
    ///
    /// Store errors count as transient: a locked or busy database usually
    /// recovers within the backoff window.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Database(_) | Error::Io(_))
    }

    /// Whether the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal(_) | Error::Instructions(_) | Error::Config(_) => true,
            Error::RetriesExhausted { last, .. } => last.is_fatal(),
            _ => false,
        }
    }

    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Error::SchemaViolation(_))
    }
}

/// Result type alias for chatclass-core
pub type Result<T> = std::result::Result<T, Error>;
