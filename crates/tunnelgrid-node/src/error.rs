//! Node error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Control(#[from] tunnelgrid_control::ControlError),

    #[error(transparent)]
    Relay(#[from] tunnelgrid_relay::RelayError),

    #[error(transparent)]
    Tunnel(#[from] tunnelgrid_tunnel::TunnelError),

    #[error("control connection closed")]
    ConnectionClosed,
}
