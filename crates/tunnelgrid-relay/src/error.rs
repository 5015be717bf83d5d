//! Error types for the relay crate.

use thiserror::Error;

/// Errors that can occur in the relay engine.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("relay already running")]
    AlreadyRunning,

    #[error("relay not running")]
    NotRunning,
}
