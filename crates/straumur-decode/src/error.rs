//! Error types for the decoding engine.

use thiserror::Error;

/// Errors raised while validating or running a decode.
///
/// Cancellation is not represented here: a cancelled decode simply ends its
/// stream without a completion marker.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A configuration or request value was rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The scoring or decoding backend failed.
    #[error("Oracle call failed: {0}")]
    Oracle(#[source] anyhow::Error),

    /// A decode step broke one of its own guarantees.
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl DecodeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// True for errors raised before any backend resource was touched.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

/// Result type for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;
