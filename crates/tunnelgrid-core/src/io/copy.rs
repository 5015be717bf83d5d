//! Bidirectional byte relay with idle and write-stall timeouts.
//!
//! Every relay variant in tunnelgrid (TCP relay, encrypted tunnel bridge)
//! funnels through `relay_bidirectional`. Each direction is a [`Lane`]
//! pumping bytes from one read half to the opposite write half; both lanes
//! are driven inside a single future, so back-pressure on one direction
//! never stalls the other. Two timers bound a connection's lifetime: the
//! idle timer fires when neither lane moves bytes for the whole window,
//! and each lane carries its own write deadline that trips when buffered
//! bytes sit unaccepted by the peer. Byte accounting is abstracted via the
//! [`RelayMetrics`] trait so callers can wire counters to `RelayStats`,
//! the Prometheus facade, or nothing at all.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant as TokioInstant, Sleep};

use crate::defaults;

/// Byte accounting hook for one relayed connection.
///
/// `record_forward` is the client→target direction, `record_reverse` the
/// target→client direction.
pub trait RelayMetrics {
    fn record_forward(&self, bytes: u64);
    fn record_reverse(&self, bytes: u64);
}

/// No-op metrics implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl RelayMetrics for NoOpMetrics {
    #[inline]
    fn record_forward(&self, _bytes: u64) {}
    #[inline]
    fn record_reverse(&self, _bytes: u64) {}
}

/// Timing and sizing knobs for one relayed connection.
#[derive(Debug, Clone, Copy)]
pub struct CopyTuning {
    /// Tear the connection down after this long with no bytes moved in
    /// either direction.
    pub idle_timeout: Duration,
    /// Maximum time buffered bytes may wait on a slow peer before the
    /// relay errors out with `TimedOut`.
    pub write_timeout: Duration,
    /// Per-direction copy buffer size.
    pub buffer_size: usize,
}

impl CopyTuning {
    pub fn new(idle_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            idle_timeout,
            write_timeout: Duration::from_secs(defaults::DEFAULT_WRITE_TIMEOUT_SECS),
            buffer_size,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

/// One copy direction: reader half of one stream, writer half of the other.
///
/// The stall timer is armed while the writer owes bytes (buffered here or
/// unflushed inside the writer) and re-armed on every accepted chunk, so a
/// peer that keeps draining slowly stays alive while a wedged one trips
/// the deadline.
struct Lane<R, W> {
    reader: R,
    writer: W,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    eof: bool,
    closed: bool,
    stall: Option<Pin<Box<Sleep>>>,
}

impl<R, W> Lane<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    fn new(reader: R, writer: W, buffer_size: usize) -> Self {
        Self {
            reader,
            writer,
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start: 0,
            end: 0,
            eof: false,
            closed: false,
            stall: None,
        }
    }

    fn arm_stall(&mut self, write_timeout: Duration) {
        let deadline = TokioInstant::now() + write_timeout;
        match self.stall.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.stall = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }

    /// Drive this lane as far as it will go. Bytes accepted by the writer
    /// accumulate into `moved`; `Ready(Ok(()))` means EOF was relayed and
    /// the writer shut down.
    fn poll_run(
        &mut self,
        cx: &mut Context<'_>,
        write_timeout: Duration,
        moved: &mut u64,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.closed {
                return Poll::Ready(Ok(()));
            }

            if let Some(stall) = self.stall.as_mut() {
                if stall.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write stalled past deadline",
                    )));
                }
            }

            if self.start < self.end {
                match Pin::new(&mut self.writer).poll_write(cx, &self.buf[self.start..self.end])
                {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                    }
                    Poll::Ready(Ok(n)) => {
                        self.start += n;
                        *moved += n as u64;
                        self.arm_stall(write_timeout);
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                continue;
            }

            // Buffer drained; flush before reading more so the peer sees
            // bytes promptly. The stall timer stays armed until the flush
            // lands.
            match Pin::new(&mut self.writer).poll_flush(cx) {
                Poll::Ready(Ok(())) => self.stall = None,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }

            if self.eof {
                match Pin::new(&mut self.writer).poll_shutdown(cx) {
                    Poll::Ready(_) => {
                        self.closed = true;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            let mut read_buf = ReadBuf::new(&mut self.buf);
            match Pin::new(&mut self.reader).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        self.eof = true;
                    } else {
                        self.start = 0;
                        self.end = n;
                        self.arm_stall(write_timeout);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Bidirectional relay with half-close handling.
///
/// Both directions run concurrently within a single task. The idle timer
/// resets whenever either lane moves bytes, so idleness (not activity)
/// triggers teardown. A lane whose peer stops accepting bytes errors out
/// after `write_timeout` even while the other direction is live.
///
/// Returns `Ok(())` on clean completion of both directions or on idle
/// timeout; I/O errors and write stalls on either side abort the relay.
pub async fn relay_bidirectional<A, B, M>(
    client: A,
    target: B,
    tuning: CopyTuning,
    metrics: &M,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
    M: RelayMetrics,
{
    let (client_r, client_w) = tokio::io::split(client);
    let (target_r, target_w) = tokio::io::split(target);

    let mut forward = Lane::new(client_r, target_w, tuning.buffer_size);
    let mut reverse = Lane::new(target_r, client_w, tuning.buffer_size);

    let mut idle = Box::pin(tokio::time::sleep(tuning.idle_timeout));

    std::future::poll_fn(|cx| {
        let mut moved_fwd = 0u64;
        let mut moved_rev = 0u64;

        let fwd = forward.poll_run(cx, tuning.write_timeout, &mut moved_fwd);
        let rev = reverse.poll_run(cx, tuning.write_timeout, &mut moved_rev);

        if moved_fwd > 0 {
            metrics.record_forward(moved_fwd);
        }
        if moved_rev > 0 {
            metrics.record_reverse(moved_rev);
        }
        if moved_fwd + moved_rev > 0 {
            idle.as_mut()
                .reset(TokioInstant::now() + tuning.idle_timeout);
        }

        let fwd_done = match fwd {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => false,
        };
        let rev_done = match rev {
            Poll::Ready(Ok(())) => true,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => false,
        };
        if fwd_done && rev_done {
            return Poll::Ready(Ok(()));
        }

        if idle.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    })
    .await
}
