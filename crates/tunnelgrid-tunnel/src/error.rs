//! Error types for the tunnel crate.

use thiserror::Error;

/// Errors from tunnel setup and operation.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("bridge already running")]
    AlreadyRunning,

    #[error("bridge not running")]
    NotRunning,
}
