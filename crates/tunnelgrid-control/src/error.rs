//! Error types for the control crate.

use thiserror::Error;

/// Errors from rule sync and failover ingestion.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("event store error: {0}")]
    Store(String),

    #[error("send to node {0} failed: {1}")]
    Send(String, String),
}
