//! WebSocket framing adapter.
//!
//! `WsStream` wraps a `WebSocketStream` and exposes plain `AsyncRead` and
//! `AsyncWrite`: each write becomes one binary frame, reads drain frames
//! byte by byte. Ping frames are answered inline, a close frame reads as
//! EOF. This is what lets the relay copy loop run unchanged over ws/wss
//! tunnels.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};

#[derive(Debug)]
pub struct WsStream<S> {
    ws: WebSocketStream<S>,
    /// Unread remainder of the last data frame.
    pending: Bytes,
}

impl<S> WsStream<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            pending: Bytes::new(),
        }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }

    /// Copy as much of `pending` as fits into `buf`.
    fn drain_pending(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending[..n]);
        self.pending = self.pending.slice(n..);
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.pending.is_empty() {
            self.drain_pending(buf);
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => {
                    self.pending = Bytes::from(data);
                    self.drain_pending(buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Text(text)))) => {
                    self.pending = Bytes::from(text.into_bytes());
                    self.drain_pending(buf);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Ok(Message::Ping(payload)))) => {
                    let mut ws = Pin::new(&mut self.ws);
                    match ws.as_mut().poll_ready(cx) {
                        Poll::Ready(Ok(())) => {
                            if let Err(err) = ws.start_send(Message::Pong(payload)) {
                                return Poll::Ready(Err(ws_err(err)));
                            }
                        }
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(ws_err(err))),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Poll::Ready(Some(Ok(Message::Pong(_) | Message::Frame(_)))) => {}
                // Close frame and stream end both read as EOF.
                Poll::Ready(Some(Ok(Message::Close(_)))) | Poll::Ready(None) => {
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(ws_err(err))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let mut ws = Pin::new(&mut self.ws);
        match ws.as_mut().poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                if let Err(err) = ws.start_send(Message::Binary(data.to_vec())) {
                    return Poll::Ready(Err(ws_err(err)));
                }
                Poll::Ready(Ok(data.len()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(ws_err(err))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.ws).poll_flush(cx).map_err(ws_err)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.ws).poll_close(cx).map_err(ws_err)
    }
}

fn ws_err(err: WsError) -> std::io::Error {
    std::io::Error::other(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{accept_async, client_async};

    #[tokio::test]
    async fn frames_carry_bytes_both_ways() {
        let (client_io, server_io) = duplex(4096);

        let server = tokio::spawn(async move {
            let ws = accept_async(server_io).await.unwrap();
            let mut stream = WsStream::new(ws);
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            stream.flush().await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let (ws, _resp) = client_async("ws://test/tunnel", client_io).await.unwrap();
        let mut stream = WsStream::new(ws);
        stream.write_all(b"framed payload").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"framed payload");

        // Server close frame reads as EOF.
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn short_reads_drain_one_frame() {
        let (client_io, server_io) = duplex(4096);

        let server = tokio::spawn(async move {
            let ws = accept_async(server_io).await.unwrap();
            let mut stream = WsStream::new(ws);
            stream.write_all(b"abcdefgh").await.unwrap();
            stream.flush().await.unwrap();
            // Hold the connection open until the client is done reading.
            let mut buf = [0u8; 8];
            let _ = stream.read(&mut buf).await;
        });

        let (ws, _resp) = client_async("ws://test/tunnel", client_io).await.unwrap();
        let mut stream = WsStream::new(ws);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        let mut rest = [0u8; 5];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"defgh");

        stream.shutdown().await.unwrap();
        server.await.unwrap();
    }
}
