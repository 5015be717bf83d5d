//! Delay-based byte-rate throttle.
//!
//! A deliberately simple token bucket: after delivering a chunk of `n`
//! bytes, the next read is held back `n / rate_bps` seconds. The pause
//! propagates as backpressure through the relay's copy loop, so no separate
//! scheduler is needed. Precision is traded for simplicity; bursts within
//! one buffer-sized chunk pass unshaped.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};

/// `AsyncRead` wrapper that caps the long-run byte rate of `inner`.
pub struct Throttle<R> {
    inner: R,
    rate_bps: u64,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> Throttle<R> {
    /// Wrap `inner`, limiting it to `rate_bps` bytes per second.
    /// A rate of zero disables throttling entirely.
    pub fn new(inner: R, rate_bps: u64) -> Self {
        Self {
            inner,
            rate_bps,
            delay: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Throttle<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(delay) = self.delay.as_mut() {
            match delay.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    self.delay = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 && self.rate_bps > 0 {
                    let pause = Duration::from_secs_f64(n as f64 / self.rate_bps as f64);
                    self.delay = Some(Box::pin(sleep_until(Instant::now() + pause)));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Writes pass through untouched; only the read side is shaped. This lets a
/// full-duplex stream be wrapped once per direction by the relay.
impl<R: AsyncWrite + Unpin> AsyncWrite for Throttle<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn zero_rate_passes_through() {
        let data = vec![7u8; 4096];
        let mut throttled = Throttle::new(&data[..], 0);
        let mut out = Vec::new();
        throttled.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 4096);
    }

    #[tokio::test]
    async fn rate_limits_elapsed_time() {
        // 2 KiB at 8 KiB/s: the pause after the final chunk still counts,
        // so the full read takes at least ~250 ms minus the last chunk's
        // share. Use a conservative lower bound.
        let data = vec![0u8; 2048];
        let mut throttled = Throttle::new(&data[..], 8192);
        let start = Instant::now();
        let mut out = Vec::new();
        throttled.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 2048);
        assert!(
            start.elapsed() >= Duration::from_millis(100),
            "throttle finished too fast: {:?}",
            start.elapsed()
        );
    }
}
