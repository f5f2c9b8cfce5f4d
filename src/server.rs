//! Server-side handshake shim.
//!
//! Sits between a listener and an unmodified banner-first consumer and makes
//! resumption invisible to peers that do not opt in:
//!
//! 1. Send the server banner, then wrap the transport so the consumer's own
//!    banner write is discarded instead of duplicated.
//! 2. Probe for the resume-capable client prelude. Absent, the consumer gets
//!    the wrapped transport and the shim is out of the picture.
//! 3. Present, a single marker byte picks the path: a zero byte opens a new
//!    session (mint a token, register, attach, hand the durable connection
//!    to the consumer); anything else is the leading byte of a token for an
//!    existing session, which gets the fresh transport attached and the
//!    consumer is *not* invoked again.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use tether_wire::SniffStream;

use crate::config::TransportConfig;
use crate::conn::ResumableConn;
use crate::preludes::{NEW_SESSION_MARKER, Preludes};
use crate::registry::{ConnRegistry, ResumptionToken, TOKEN_LEN};
use crate::{BoxedStream, RawStream};

/// Downstream consumer of accepted streams.
///
/// Receives either a raw (non-resumable) transport or a durable resumable
/// connection and must not assume which; both are plain byte streams that
/// start where the dialect expects the client's first bytes.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle_connection(&self, stream: BoxedStream) -> impl Future<Output = ()> + Send;
}

/// Resumption-aware front for a banner-first server.
pub struct ResumableServer<H> {
    handler: H,
    registry: ConnRegistry,
    preludes: Preludes,
    config: TransportConfig,
}

impl<H: ConnectionHandler> ResumableServer<H> {
    pub fn new(handler: H, config: TransportConfig) -> Self {
        Self {
            handler,
            registry: ConnRegistry::new(),
            preludes: Preludes::default(),
            config,
        }
    }

    /// Override the banner literals (the default speaks the stock
    /// secure-shell flavor).
    pub fn with_preludes(mut self, preludes: Preludes) -> Self {
        self.preludes = preludes;
        self
    }

    /// The token registry backing this server.
    pub fn registry(&self) -> &ConnRegistry {
        &self.registry
    }

    /// Accept loop: one task per physical connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let local = stream.local_addr().ok();
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_physical(stream, local, Some(peer)).await;
            });
        }
    }

    /// Run the resumption probe on one accepted physical stream.
    ///
    /// On the fall-through and new-session paths this resolves when the
    /// downstream consumer is done with the stream; on the reattach path it
    /// resolves as soon as the transport is attached.
    pub async fn handle_physical<S: RawStream + 'static>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) {
        if let Err(err) = self.probe(stream, local_addr, peer_addr).await {
            match err.kind() {
                io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe => {
                    debug!(peer = ?peer_addr, error = %err, "connection ended during the resumption probe");
                }
                _ => warn!(peer = ?peer_addr, error = %err, "resumption probe failed"),
            }
        }
    }

    async fn probe<S: RawStream + 'static>(
        &self,
        mut stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> io::Result<()> {
        // The banner goes out before anything is known about the peer; the
        // write-skip keeps the downstream consumer from sending it twice.
        let server_prelude = self.preludes.server_prelude();
        stream.write_all(&server_prelude).await?;
        let mut sniff = SniffStream::new(stream, server_prelude.len());

        if !sniff.read_prelude(&self.preludes.client_prelude()).await? {
            debug!(peer = ?peer_addr, "peer is not resume-aware, falling through");
            self.handler.handle_connection(Box::new(sniff)).await;
            return Ok(());
        }
        // Burn the skip allowance ourselves: from here on the wire carries
        // frames, not the dialect.
        sniff.write_all(&server_prelude).await?;

        if sniff.read_prelude(&[NEW_SESSION_MARKER]).await? {
            let token = ResumptionToken::generate();
            sniff.write_all(token.as_bytes()).await?;

            let conn = ResumableConn::new(local_addr, peer_addr, self.config);
            self.registry.register(token, conn.clone()).await;
            if conn.attach(sniff).await.is_err() {
                return Ok(());
            }
            info!(peer = ?peer_addr, "new resumable session");
            self.handler.handle_connection(Box::new(conn)).await;
            return Ok(());
        }

        // Reattach: the nonzero byte that failed the marker probe is the
        // head of the peer's token.
        let mut token_bytes = [0u8; TOKEN_LEN];
        sniff.read_exact(&mut token_bytes).await?;
        let Some(token) = ResumptionToken::from_bytes(token_bytes) else {
            warn!(peer = ?peer_addr, "rejected reattach with a malformed token");
            return Ok(());
        };
        match self.registry.lookup(&token).await {
            Some(conn) => {
                debug!(peer = ?peer_addr, "reattaching session");
                if conn.attach(sniff).await.is_err() {
                    debug!(peer = ?peer_addr, "session closed before the reattach completed");
                }
            }
            None => {
                warn!(peer = ?peer_addr, "rejected reattach with an unknown token");
            }
        }
        Ok(())
    }
}
