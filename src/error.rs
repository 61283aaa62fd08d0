//! Error types for the admission control engine.

use thiserror::Error;

/// Main error type for engine construction and configuration.
///
/// Backend faults during request evaluation never appear here: they are
/// represented as [`crate::store::StoreError`] and consumed by the circuit
/// breaker, so every evaluation terminates in a `Decision`.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced outside an evaluation (e.g. connect)
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
