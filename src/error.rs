//! Error types surfaced by the adaptor registry and adaptors

use thiserror::Error;

/// Failure reported by an adaptor or by the adaptor factory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdaptorError {
    #[error("can't load adaptor class {0}")]
    UnknownClass(String),
    #[error("adaptor class {0} is already registered")]
    DuplicateClass(String),
    #[error("invalid params for adaptor: {0}")]
    InvalidParams(String),
    #[error("failed to start adaptor: {0}")]
    StartFailure(String),
    #[error("adaptor failed to stop cleanly: {0}")]
    ShutdownFailure(String),
}

/// Failure reported by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("bad input syntax: {0}")]
    BadSyntax(String),
    #[error(transparent)]
    Adaptor(#[from] AdaptorError),
    #[error("adaptor {0} is not running")]
    NotRunning(String),
}

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
