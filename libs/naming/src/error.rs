//! Error types for name resolution.

use coordination::ZkError;
use thiserror::Error;

use crate::NamingType;

/// Errors returned by resolvers and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    /// No factory is bound for the requested naming type.
    #[error("naming type {0} is not registered")]
    Unsupported(NamingType),

    /// The string does not name a naming type.
    #[error("unknown naming type: {0}")]
    UnknownType(String),

    /// Service names are non-empty, `/` separated, without empty segments.
    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    /// The name or instance is not tracked by this resolver.
    #[error("not found: {0}")]
    NotFound(String),

    /// The coordination service rejected the request.
    #[error("coordination error: {0}")]
    Coordination(#[from] ZkError),
}

impl NamingError {
    /// Returns true if a later retry may succeed (connection-level failures).
    pub fn is_retryable(&self) -> bool {
        matches!(self, NamingError::Coordination(err) if err.is_retryable())
    }

    /// Returns true for errors caused by bad input or setup, which never
    /// heal by retrying.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            NamingError::Unsupported(_) | NamingError::UnknownType(_) | NamingError::InvalidName(_)
        )
    }
}

/// Shorthand result alias for naming operations.
pub type NamingResult<T> = Result<T, NamingError>;
