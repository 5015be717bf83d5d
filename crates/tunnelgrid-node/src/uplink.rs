//! WebSocket uplink to the control plane.
//!
//! Frames are JSON text messages. The node identifies itself with query
//! parameters on the connect URL; the control plane answers a fresh
//! connection with a forced full rule sync, so there is no handshake frame.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnelgrid_control::{decode, encode, NodeMessage, PlaneMessage};

use crate::config::NodeConfig;
use crate::error::NodeError;

/// Channels for one live control-plane session.
pub struct Uplink {
    /// Outgoing node → plane frames.
    pub tx: mpsc::Sender<NodeMessage>,
    /// Incoming plane → node frames. `None` means the connection is gone.
    pub rx: mpsc::Receiver<PlaneMessage>,
}

/// Connect to the control plane and spawn the send/recv bridge tasks.
pub async fn connect(config: &NodeConfig, shutdown: CancellationToken) -> Result<Uplink, NodeError> {
    let url = session_url(&config.control_url, &config.node_id, &config.token);
    info!(url = %config.control_url, node_id = %config.node_id, "connecting to control plane");

    let (ws_stream, _response) = tokio_tungstenite::connect_async(&url).await?;
    let (mut ws_sink, mut ws_source) = ws_stream.split();

    // Raw frame lane so the recv task can answer pings without re-encoding.
    let (frame_tx, mut frame_rx) = mpsc::channel::<Message>(64);
    let (node_tx, mut node_rx) = mpsc::channel::<NodeMessage>(64);
    let (plane_tx, plane_rx) = mpsc::channel::<PlaneMessage>(64);

    let send_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = send_shutdown.cancelled() => {
                    debug!("uplink send task shutting down");
                    let _ = ws_sink.close().await;
                    return;
                }

                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        let _ = ws_sink.close().await;
                        return;
                    };
                    if let Err(e) = ws_sink.send(frame).await {
                        error!(error = %e, "failed to send control frame");
                        return;
                    }
                }

                msg = node_rx.recv() => {
                    match msg {
                        Some(node_msg) => match encode(&node_msg) {
                            Ok(raw) => {
                                if let Err(e) = ws_sink.send(Message::Text(raw)).await {
                                    error!(error = %e, "failed to send control frame");
                                    return;
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "failed to encode node message");
                            }
                        },
                        None => {
                            debug!("uplink send channel closed");
                            let _ = ws_sink.close().await;
                            return;
                        }
                    }
                }
            }
        }
    });

    let recv_shutdown = shutdown;
    let pong_tx = frame_tx;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = recv_shutdown.cancelled() => {
                    debug!("uplink recv task shutting down");
                    return;
                }

                msg = ws_source.next() => {
                    match msg {
                        Some(Ok(Message::Text(raw))) => {
                            match decode::<PlaneMessage>(&raw) {
                                Ok(frame) => {
                                    if plane_tx.send(frame).await.is_err() {
                                        debug!("plane receive channel closed");
                                        return;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "failed to decode control frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if pong_tx.send(Message::Pong(payload)).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("control plane closed the connection");
                            return;
                        }
                        Some(Ok(_)) => {} // ignore binary/pong frames
                        Some(Err(e)) => {
                            error!(error = %e, "websocket error on uplink");
                            return;
                        }
                        None => {
                            info!("uplink stream ended");
                            return;
                        }
                    }
                }
            }
        }
    });

    Ok(Uplink {
        tx: node_tx,
        rx: plane_rx,
    })
}

fn session_url(control_url: &str, node_id: &str, token: &str) -> String {
    let sep = if control_url.contains('?') { '&' } else { '?' };
    format!("{control_url}{sep}node_id={node_id}&token={token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tunnelgrid_control::{FailoverEventReport, FailoverEventType};

    fn config(port: u16) -> NodeConfig {
        toml::from_str(&format!(
            r#"
node_id = "node-test"
control_url = "ws://127.0.0.1:{port}/ws/node"
token = "secret"
"#
        ))
        .unwrap()
    }

    #[test]
    fn session_url_appends_identity() {
        assert_eq!(
            session_url("ws://c/ws", "n1", "t1"),
            "ws://c/ws?node_id=n1&token=t1"
        );
        assert_eq!(
            session_url("ws://c/ws?v=2", "n1", "t1"),
            "ws://c/ws?v=2&node_id=n1&token=t1"
        );
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let push = PlaneMessage::DeleteRule {
                tunnel_id: "tun-1".into(),
            };
            ws.send(Message::Text(encode(&push).unwrap())).await.unwrap();

            // First text frame back should be a failover event.
            while let Some(msg) = ws.next().await {
                if let Message::Text(raw) = msg.unwrap() {
                    return decode::<NodeMessage>(&raw).unwrap();
                }
            }
            panic!("no frame from node");
        });

        let shutdown = CancellationToken::new();
        let mut uplink = connect(&config(port), shutdown.clone()).await.unwrap();

        let received = uplink.rx.recv().await.unwrap();
        assert_eq!(
            received,
            PlaneMessage::DeleteRule {
                tunnel_id: "tun-1".into()
            }
        );

        let event = NodeMessage::FailoverEvent(FailoverEventReport {
            node_id: "node-test".into(),
            tunnel_id: "tun-1".into(),
            event_type: FailoverEventType::Failover,
            from_group_id: None,
            to_group_id: None,
            reason: "test".into(),
            failure_duration_secs: 0,
            timestamp: 0,
        });
        uplink.tx.send(event.clone()).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen, event);
        shutdown.cancel();
    }
}
