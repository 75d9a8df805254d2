//! Idle Timeout Wrapper
//!
//! [`IdleTimeout`] fails any pending read or write once the wrapped
//! connection has seen no activity for the configured duration. The relay
//! treats that failure like any other I/O error and tears the session down.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::error::IdleExpired;

/// Callback invoked when a connection idles out
pub type IdleCallback = Arc<dyn Fn() + Send + Sync>;

/// Connection wrapper that expires after a period without reads or writes
pub struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
    on_expire: Option<IdleCallback>,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            expired: false,
            on_expire: None,
        }
    }

    /// Register a callback fired once, when the connection expires
    pub fn on_expire<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_expire = Some(Arc::new(callback));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn touch(&mut self) {
        self.deadline.as_mut().reset(Instant::now() + self.timeout);
    }

    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if !self.expired {
            if self.deadline.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            self.expired = true;
            if let Some(callback) = &self.on_expire {
                callback();
            }
        }
        Poll::Ready(IdleExpired(self.timeout).into_io_error())
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(Err(IdleExpired(this.timeout).into_io_error()));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if result.is_ok() {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_deadline(cx).map(Err),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.expired {
            return Poll::Ready(Err(IdleExpired(this.timeout).into_io_error()));
        }

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                if result.is_ok() {
                    this.touch();
                }
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_deadline(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Adds `.with_idle_timeout()` to any stream
pub trait IdleTimeoutExt: Sized {
    fn with_idle_timeout(self, timeout: Duration) -> IdleTimeout<Self>;
}

impl<S: AsyncRead + AsyncWrite + Unpin> IdleTimeoutExt for S {
    fn with_idle_timeout(self, timeout: Duration) -> IdleTimeout<Self> {
        IdleTimeout::new(self, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_idle_read_expires() {
        let (conn, _peer) = tokio::io::duplex(64);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut conn = conn
            .with_idle_timeout(Duration::from_millis(150))
            .on_expire(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(IdleExpired::is_idle_expiry(&err));
        assert!(conn.is_expired());

        // Further use keeps failing without re-firing the callback.
        assert!(conn.write_all(b"late").await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_deadline() {
        let (conn, mut peer) = tokio::io::duplex(64);
        let mut conn = conn.with_idle_timeout(Duration::from_millis(150));

        let writer = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                peer.write_all(b"ping").await.unwrap();
            }
            peer
        });

        let mut buf = [0u8; 4];
        for _ in 0..5 {
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
        assert!(!conn.is_expired());

        let _peer = writer.await.unwrap();
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(IdleExpired::is_idle_expiry(&err));
    }
}
