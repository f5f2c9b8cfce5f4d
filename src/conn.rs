//! The durable connection endpoint.
//!
//! A [`ResumableConn`] owns the two byte buffers that make resumption work:
//! everything written locally stays in the replay buffer until the peer
//! confirms it, and everything received sits in the receive buffer until the
//! local reader drains it. The physical transport underneath can come and go;
//! readers and writers never see the churn, they just wait.
//!
//! Concurrency model: one mutex guards all state, and every transition that
//! could unblock a waiter wakes the whole waker list. Wakers are registered
//! under the same lock that checks their condition, so wakeups cannot be
//! lost. Deadlines are re-checked on every wakeup.

use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::TransportConfig;
use crate::error::StreamError;
use crate::{RawStream, driver};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct State {
    pub(crate) closed: bool,
    pub(crate) read_deadline: Option<Instant>,
    pub(crate) write_deadline: Option<Instant>,

    /// End offset of `receive_buffer` in peer-stream coordinates: the total
    /// number of bytes received from the peer so far.
    pub(crate) read_position: u64,
    pub(crate) receive_buffer: VecDeque<u8>,

    /// Stream offset of the first byte of `replay_buffer`: the total number
    /// of bytes the peer has confirmed consuming.
    pub(crate) replay_position: u64,
    pub(crate) replay_buffer: VecDeque<u8>,

    /// One-shot closer for the live attachment, if any.
    pub(crate) attachment: Option<CancellationToken>,
    detach_timer: Option<tokio::task::JoinHandle<()>>,

    // Flow-control counters for the current attachment. Owned by the driver
    // but guarded by the conn mutex so pump wakeups cannot be lost.
    pub(crate) remote_read_position: u64,
    pub(crate) remote_window: u64,
    pub(crate) sent_window_start: u64,

    wakers: Vec<Waker>,
}

impl State {
    /// Wake everything that may be waiting on this connection's state.
    pub(crate) fn broadcast(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    fn register(&mut self, cx: &mut Context<'_>) {
        if !self.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.wakers.push(cx.waker().clone());
        }
    }
}

pub(crate) struct Shared {
    pub(crate) cfg: TransportConfig,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("conn state mutex poisoned")
    }
}

/// Close without waiting for the driver to wind down. Idempotent.
pub(crate) fn close_now(shared: &Arc<Shared>) {
    let mut st = shared.lock();
    if st.closed {
        return;
    }
    st.closed = true;
    if let Some(cancel) = &st.attachment {
        cancel.cancel();
    }
    if let Some(timer) = st.detach_timer.take() {
        timer.abort();
    }
    st.broadcast();
    debug!(local = ?shared.local_addr, peer = ?shared.peer_addr, "connection closed");
}

/// (Re)start the countdown that closes the connection if no transport
/// attaches in time.
pub(crate) fn arm_detach_timer(shared: &Arc<Shared>, st: &mut State) {
    if let Some(old) = st.detach_timer.take() {
        old.abort();
    }
    let shared = Arc::clone(shared);
    st.detach_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(shared.cfg.detach_timeout).await;
        close_now(&shared);
    }));
}

/// Park until `cond` yields a value; re-evaluated on every broadcast.
pub(crate) async fn wait_state<T>(
    shared: &Shared,
    mut cond: impl FnMut(&mut State) -> Option<T>,
) -> T {
    poll_fn(|cx| {
        let mut st = shared.lock();
        match cond(&mut st) {
            Some(value) => Poll::Ready(value),
            None => {
                st.register(cx);
                Poll::Pending
            }
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// ResumableConn
// ---------------------------------------------------------------------------

/// A byte stream that survives failures of its physical transport.
///
/// Implements `AsyncRead`/`AsyncWrite`; reads and writes never observe a
/// detach, they simply wait until a transport is attached again (or the
/// connection closes, or their deadline passes). Clones share the same
/// underlying connection; keep one clone per concurrent reader/writer.
pub struct ResumableConn {
    pub(crate) shared: Arc<Shared>,
    read_timer: Option<DeadlineTimer>,
    write_timer: Option<DeadlineTimer>,
}

struct DeadlineTimer {
    at: Instant,
    sleep: Pin<Box<Sleep>>,
}

impl ResumableConn {
    /// Create an unattached connection.
    ///
    /// The addresses are whatever was observed on the first physical
    /// transport and stay fixed for the life of the connection. The detach
    /// countdown starts immediately: a connection nothing ever attaches to
    /// closes itself after `cfg.detach_timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
        cfg: TransportConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            cfg,
            local_addr,
            peer_addr,
            state: Mutex::new(State {
                closed: false,
                read_deadline: None,
                write_deadline: None,
                read_position: 0,
                receive_buffer: VecDeque::new(),
                replay_position: 0,
                replay_buffer: VecDeque::new(),
                attachment: None,
                detach_timer: None,
                remote_read_position: 0,
                remote_window: 0,
                sent_window_start: 0,
                wakers: Vec::new(),
            }),
        });
        {
            let mut st = shared.lock();
            arm_detach_timer(&shared, &mut st);
        }
        Self {
            shared,
            read_timer: None,
            write_timer: None,
        }
    }

    /// Bind a live physical transport to this connection.
    ///
    /// Any current attachment is told to close first and this call waits for
    /// it to wind down, so at most one transport is ever attached. On success
    /// the resumption handshake and both pumps run on a background task.
    pub async fn attach<S: RawStream + 'static>(&self, stream: S) -> Result<(), StreamError> {
        let cancel = wait_state(&self.shared, |st| {
            if st.closed {
                return Some(None);
            }
            if let Some(current) = &st.attachment {
                current.cancel();
                return None;
            }
            let cancel = CancellationToken::new();
            st.attachment = Some(cancel.clone());
            if let Some(timer) = st.detach_timer.take() {
                timer.abort();
            }
            st.broadcast();
            Some(Some(cancel))
        })
        .await;

        let Some(cancel) = cancel else {
            // Closed: the physical transport is released (and thereby closed)
            // instead of being adopted.
            drop(stream);
            return Err(StreamError::Closed);
        };

        debug!(local = ?self.shared.local_addr, peer = ?self.shared.peer_addr, "transport attached");
        tokio::spawn(driver::run(
            Arc::clone(&self.shared),
            Box::new(stream),
            cancel,
        ));
        Ok(())
    }

    /// Preempt the current attachment, if any, and wait for it to clear.
    pub async fn detach(&self) {
        wait_state(&self.shared, |st| match &st.attachment {
            Some(cancel) => {
                cancel.cancel();
                None
            }
            None => Some(()),
        })
        .await;
    }

    /// Close the connection: detach, wake every waiter, reject all future
    /// operations. Idempotent; repeated calls return `Ok`.
    pub async fn close(&self) -> io::Result<()> {
        close_now(&self.shared);
        wait_state(&self.shared, |st| st.attachment.is_none().then_some(())).await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.shared.lock().attachment.is_some()
    }

    /// Resolve once the connection is closed.
    pub async fn wait_closed(&self) {
        wait_state(&self.shared, |st| st.closed.then_some(())).await;
    }

    /// Resolve once no transport is attached (including after close).
    pub async fn wait_detached(&self) {
        wait_state(&self.shared, |st| st.attachment.is_none().then_some(())).await;
    }

    /// Set both deadlines. `None` means wait indefinitely.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(StreamError::Closed.into_io());
        }
        st.read_deadline = deadline;
        st.write_deadline = deadline;
        st.broadcast();
        Ok(())
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(StreamError::Closed.into_io());
        }
        st.read_deadline = deadline;
        st.broadcast();
        Ok(())
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        let mut st = self.shared.lock();
        if st.closed {
            return Err(StreamError::Closed.into_io());
        }
        st.write_deadline = deadline;
        st.broadcast();
        Ok(())
    }

    /// Address captured when the connection was created.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr
    }

    /// Peer address captured when the connection was created.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Poll the per-direction deadline timer; `Ready` means it crossed.
    fn poll_deadline(
        slot: &mut Option<DeadlineTimer>,
        deadline: Option<Instant>,
        cx: &mut Context<'_>,
    ) -> Poll<()> {
        let Some(at) = deadline else {
            *slot = None;
            return Poll::Pending;
        };
        if slot.as_ref().is_none_or(|timer| timer.at != at) {
            *slot = Some(DeadlineTimer {
                at,
                sleep: Box::pin(sleep_until(at)),
            });
        }
        match slot {
            Some(timer) => timer.sleep.as_mut().poll(cx),
            None => Poll::Pending,
        }
    }
}

impl Clone for ResumableConn {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            read_timer: None,
            write_timer: None,
        }
    }
}

impl fmt::Debug for ResumableConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("ResumableConn")
            .field("local_addr", &self.shared.local_addr)
            .field("peer_addr", &self.shared.peer_addr)
            .field("closed", &st.closed)
            .field("attached", &st.attachment.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stream traits
// ---------------------------------------------------------------------------

impl AsyncRead for ResumableConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let deadline;
        {
            let mut st = this.shared.lock();
            if st.closed {
                return Poll::Ready(Err(StreamError::Closed.into_io()));
            }
            deadline = st.read_deadline;
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            if !st.receive_buffer.is_empty() {
                let n = st.receive_buffer.len().min(buf.remaining());
                let (front, back) = st.receive_buffer.as_slices();
                if n <= front.len() {
                    buf.put_slice(&front[..n]);
                } else {
                    buf.put_slice(front);
                    buf.put_slice(&back[..n - front.len()]);
                }
                st.receive_buffer.drain(..n);
                // Receive headroom opened up; the send pump reports it to the
                // peer as a window advance.
                st.broadcast();
                return Poll::Ready(Ok(()));
            }
            st.register(cx);
        }
        if Self::poll_deadline(&mut this.read_timer, deadline, cx).is_ready() {
            return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
        }
        Poll::Pending
    }
}

impl AsyncWrite for ResumableConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let deadline;
        {
            let mut st = this.shared.lock();
            if st.closed {
                return Poll::Ready(Err(StreamError::Closed.into_io()));
            }
            deadline = st.write_deadline;
            if deadline.is_some_and(|at| Instant::now() >= at) {
                return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let headroom = this.shared.cfg.buffer_size - st.replay_buffer.len();
            if headroom > 0 {
                let n = headroom.min(buf.len());
                st.replay_buffer.extend(&buf[..n]);
                st.broadcast();
                return Poll::Ready(Ok(n));
            }
            st.register(cx);
        }
        if Self::poll_deadline(&mut this.write_timer, deadline, cx).is_ready() {
            return Poll::Ready(Err(StreamError::DeadlineExceeded.into_io()));
        }
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let st = self.shared.lock();
        if st.closed {
            return Poll::Ready(Err(StreamError::Closed.into_io()));
        }
        // Delivery is the pumps' business; accepted bytes are already as
        // flushed as they can get.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        close_now(&self.shared);
        Poll::Ready(Ok(()))
    }
}
