//! Shared error types for peerlink.

use thiserror::Error;

/// Top-level error type shared by every peerlink crate.
#[derive(Error, Debug)]
pub enum PeerlinkError {
    /// A configuration value is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An optional component was requested but never configured.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// A network-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid user input (bad peer id, malformed address, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The node is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with PeerlinkError.
pub type PeerlinkResult<T> = Result<T, PeerlinkError>;
