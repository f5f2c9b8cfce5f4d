//! Prelude probing over a raw stream.
//!
//! `SniffStream` answers one question, "does the peer's next output start
//! with this exact byte literal?", without consuming anything on a mismatch,
//! and it can silently discard a fixed number of leading bytes written
//! through it. Together those let a resumption-aware endpoint share a
//! listener with an unmodified banner-first protocol: probe, and on mismatch
//! hand the stream over with every byte still in place.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// A raw stream with prelude probing and write-skip.
#[derive(Debug)]
pub struct SniffStream<S> {
    inner: S,
    /// Bytes pulled off the wire by probes but not yet consumed by a reader.
    peeked: VecDeque<u8>,
    /// How many bytes of upcoming writes to discard.
    skip_write: usize,
}

impl<S> SniffStream<S> {
    /// Wrap `inner`, discarding the first `skip_write` bytes written.
    pub fn new(inner: S, skip_write: usize) -> Self {
        Self {
            inner,
            peeked: VecDeque::new(),
            skip_write,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead + Unpin> SniffStream<S> {
    /// Check whether the stream starts with `prelude`.
    ///
    /// On a match the literal is consumed and `true` is returned. On a
    /// mismatch nothing is consumed: every byte read while probing stays
    /// available to subsequent reads. An EOF that arrives while the received
    /// prefix still matches is surfaced as `UnexpectedEof`.
    pub async fn read_prelude(&mut self, prelude: &[u8]) -> io::Result<bool> {
        for (i, byte) in self.peeked.iter().enumerate() {
            if i >= prelude.len() {
                break;
            }
            if *byte != prelude[i] {
                return Ok(false);
            }
        }

        let mut chunk = [0u8; 256];
        while self.peeked.len() < prelude.len() {
            let start = self.peeked.len();
            let want = (prelude.len() - start).min(chunk.len());
            let n = self.inner.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside prelude",
                ));
            }
            self.peeked.extend(&chunk[..n]);
            if chunk[..n] != prelude[start..start + n] {
                return Ok(false);
            }
        }

        self.peeked.drain(..prelude.len());
        Ok(true)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.peeked.is_empty() {
            let n = this.peeked.len().min(buf.remaining());
            let (front, back) = this.peeked.as_slices();
            if n <= front.len() {
                buf.put_slice(&front[..n]);
            } else {
                buf.put_slice(front);
                buf.put_slice(&back[..n - front.len()]);
            }
            this.peeked.drain(..n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.skip_write > 0 {
            let skipped = this.skip_write.min(buf.len());
            if skipped == buf.len() {
                this.skip_write -= skipped;
                return Poll::Ready(Ok(skipped));
            }
            return match Pin::new(&mut this.inner).poll_write(cx, &buf[skipped..]) {
                Poll::Ready(Ok(n)) => {
                    this.skip_write = 0;
                    Poll::Ready(Ok(skipped + n))
                }
                other => other,
            };
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
