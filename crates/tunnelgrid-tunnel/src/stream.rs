//! Tunnel stream types and connection establishment.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{client_async_with_config, tungstenite::protocol::WebSocketConfig};
use tracing::debug;

use crate::config::{TunnelConfig, TunnelKind};
use crate::error::TunnelError;
use crate::tls;
use crate::ws::WsStream;

/// One established tunnel connection.
///
/// A closed set of transports rather than a boxed trait object: every kind
/// the node can be asked to run is known at compile time, and the enum
/// keeps the relay path free of vtable indirection.
#[derive(Debug)]
pub enum TunnelStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Ws(Box<WsStream<TcpStream>>),
    Wss(Box<WsStream<TlsStream<TcpStream>>>),
}

impl TunnelStream {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelStream::Tcp(_) => TunnelKind::Tcp,
            TunnelStream::Tls(_) => TunnelKind::Tls,
            TunnelStream::Ws(_) => TunnelKind::Ws,
            TunnelStream::Wss(_) => TunnelKind::Wss,
        }
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TunnelStream::Ws(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            TunnelStream::Wss(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_write(cx, data),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            TunnelStream::Ws(s) => Pin::new(s.as_mut()).poll_write(cx, data),
            TunnelStream::Wss(s) => Pin::new(s.as_mut()).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TunnelStream::Ws(s) => Pin::new(s.as_mut()).poll_flush(cx),
            TunnelStream::Wss(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TunnelStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TunnelStream::Ws(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            TunnelStream::Wss(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial the configured remote and perform the transport handshakes.
///
/// The connect timeout covers the whole sequence, TLS and WebSocket
/// upgrades included.
pub async fn connect(config: &TunnelConfig) -> Result<TunnelStream, TunnelError> {
    config.validate()?;
    match tokio::time::timeout(config.connect_timeout(), connect_inner(config)).await {
        Ok(result) => result,
        Err(_) => Err(TunnelError::ConnectTimeout(config.remote())),
    }
}

async fn connect_inner(config: &TunnelConfig) -> Result<TunnelStream, TunnelError> {
    let tcp = TcpStream::connect(config.remote()).await?;
    apply_tcp_options(&tcp, config)?;
    debug!(remote = %config.remote(), kind = ?config.kind, "tunnel dialed");

    match config.kind {
        TunnelKind::Tcp => Ok(TunnelStream::Tcp(tcp)),
        TunnelKind::Tls => {
            let tls = tls_handshake(config, tcp).await?;
            Ok(TunnelStream::Tls(Box::new(tls)))
        }
        TunnelKind::Ws => {
            let ws = ws_handshake(config, tcp).await?;
            Ok(TunnelStream::Ws(Box::new(ws)))
        }
        TunnelKind::Wss => {
            let tls = tls_handshake(config, tcp).await?;
            let ws = ws_handshake(config, tls).await?;
            Ok(TunnelStream::Wss(Box::new(ws)))
        }
    }
}

async fn tls_handshake(
    config: &TunnelConfig,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, TunnelError> {
    let client_config = tls::build_client_config(config)?;
    let name = tls::server_name(config)?;
    let connector = TlsConnector::from(client_config);
    Ok(connector.connect(name, tcp).await?)
}

async fn ws_handshake<S>(config: &TunnelConfig, inner: S) -> Result<WsStream<S>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        ..Default::default()
    };
    let (ws, _response) = client_async_with_config(config.ws_url(), inner, Some(ws_config))
        .await
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;
    Ok(WsStream::new(ws))
}

fn apply_tcp_options(stream: &TcpStream, config: &TunnelConfig) -> Result<(), TunnelError> {
    stream.set_nodelay(true)?;
    if config.keepalive_secs > 0 {
        let sock = socket2::SockRef::from(stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}
