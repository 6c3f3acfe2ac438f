//! Common error types for straumur.

use straumur_decode::DecodeError;
use thiserror::Error;

/// Errors that can occur while answering a question.
#[derive(Debug, Error)]
pub enum StraumurError {
    /// The question was missing or blank after trimming.
    #[error("No question provided")]
    EmptyQuestion,

    /// The message named a question type this service does not answer.
    #[error("Unknown question type: {0:?}")]
    UnknownKind(String),

    /// The message could not be parsed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Decoding failed or was misconfigured.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A masked question arrived but no extractive answerer is installed.
    #[error("No extractive answerer is configured")]
    NoExtractor,

    /// The extractive answerer failed.
    #[error("Extractive answer failed: {0}")]
    Extraction(#[source] anyhow::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StraumurError {
    /// True for errors raised before any model resource was touched.
    pub fn is_validation(&self) -> bool {
        match self {
            StraumurError::EmptyQuestion
            | StraumurError::UnknownKind(_)
            | StraumurError::InvalidMessage(_)
            | StraumurError::Config(_) => true,
            StraumurError::Decode(e) => e.is_validation(),
            StraumurError::NoExtractor | StraumurError::Extraction(_) => false,
        }
    }
}

/// Result type for straumur operations.
pub type StraumurResult<T> = Result<T, StraumurError>;
