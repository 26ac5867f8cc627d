//! Common error types for QDP

use thiserror::Error;

/// Common result type for QDP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across QDP services
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// State transition that violates a ledger or triage invariant
    ///
    /// **[QDP-JL-030]** e.g. a second SUCCESS on a job resolving to a
    /// different asset, or promoting a record that failed validation.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
