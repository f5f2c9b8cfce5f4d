//! Client-side handshake shim and redial supervisor.
//!
//! Dialing mirrors the server shim: send the shared banner prefix, probe for
//! the resume-capable server banner, and fall back to a plain wrapped stream
//! when it is absent. When the server is resume-aware the client opens a new
//! session, keeps the returned token, and can later splice a fresh physical
//! transport into the same durable connection by presenting that token.
//!
//! `connect_with_redial` automates the splice: a supervisor task watches for
//! detaches and redials until the connection closes for good.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use tether_wire::SniffStream;

use crate::config::TransportConfig;
use crate::conn::ResumableConn;
use crate::error::StreamError;
use crate::preludes::{NEW_SESSION_MARKER, Preludes};
use crate::registry::{ResumptionToken, TOKEN_LEN};
use crate::{BoxedStream, RawStream};

/// Pause between reattach attempts after a failure.
const REATTACH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Outcome of a client-side probe.
pub enum Connected {
    /// The peer is not resume-aware. The wrapped stream passes every byte
    /// through; the banner prefix is already on the wire, so the dialect
    /// client's own prefix write is absorbed.
    Direct(BoxedStream),
    /// The peer accepted a new resumable session.
    Resumable(ResumableSession),
}

/// A live resumable session and the token that can revive it.
pub struct ResumableSession {
    pub conn: ResumableConn,
    pub token: ResumptionToken,
}

/// Produces fresh physical streams for the redial supervisor.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self) -> impl Future<Output = io::Result<BoxedStream>> + Send;
}

/// Redials one TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer(pub SocketAddr);

impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(self.0).await?;
        Ok(Box::new(stream))
    }
}

/// Resumption-aware dialing front.
#[derive(Debug, Clone)]
pub struct ResumableClient {
    preludes: Preludes,
    config: TransportConfig,
}

impl ResumableClient {
    pub fn new(config: TransportConfig) -> Self {
        Self {
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

    /// Dial a TCP peer and probe it for resumption support.
    pub async fn dial(&self, addr: SocketAddr) -> io::Result<Connected> {
        let stream = TcpStream::connect(addr).await?;
        let local = stream.local_addr().ok();
        self.connect(stream, local, Some(addr)).await
    }

    /// Probe an established physical stream for resumption support.
    pub async fn connect<S: RawStream + 'static>(
        &self,
        mut stream: S,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> io::Result<Connected> {
        // Whatever dialect the caller speaks, its first bytes are the shared
        // prefix, so sending it early costs nothing and lets the server
        // answer before the caller commits.
        stream.write_all(&self.preludes.banner_prefix).await?;
        let mut sniff = SniffStream::new(stream, self.preludes.banner_prefix.len());

        if !sniff.read_prelude(&self.preludes.server_prelude()).await? {
            debug!(peer = ?peer_addr, "peer is not resume-aware");
            return Ok(Connected::Direct(Box::new(sniff)));
        }
        // Burn the skip allowance; frames follow, not the dialect.
        sniff.write_all(&self.preludes.banner_prefix).await?;

        let mut hello = self.preludes.client_suffix.clone();
        hello.push(NEW_SESSION_MARKER);
        sniff.write_all(&hello).await?;

        let mut token_bytes = [0u8; TOKEN_LEN];
        sniff.read_exact(&mut token_bytes).await?;
        let Some(token) = ResumptionToken::from_bytes(token_bytes) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "server sent a malformed resumption token",
            ));
        };

        let conn = ResumableConn::new(local_addr, peer_addr, self.config);
        conn.attach(sniff)
            .await
            .map_err(|_| StreamError::Closed.into_io())?;
        debug!(peer = ?peer_addr, "resumable session established");
        Ok(Connected::Resumable(ResumableSession { conn, token }))
    }

    /// Splice a fresh physical stream into an existing session.
    pub async fn reattach<S: RawStream + 'static>(
        &self,
        conn: &ResumableConn,
        token: ResumptionToken,
        mut stream: S,
    ) -> io::Result<()> {
        stream.write_all(&self.preludes.banner_prefix).await?;
        let mut sniff = SniffStream::new(stream, self.preludes.banner_prefix.len());

        if !sniff.read_prelude(&self.preludes.server_prelude()).await? {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "peer stopped advertising resumption",
            ));
        }
        sniff.write_all(&self.preludes.banner_prefix).await?;

        // The token's nonzero first byte doubles as the not-a-new-session
        // marker.
        let mut hello = self.preludes.client_suffix.clone();
        hello.extend_from_slice(token.as_bytes());
        sniff.write_all(&hello).await?;

        conn.attach(sniff)
            .await
            .map_err(|_| StreamError::Closed.into_io())
    }

    /// Establish a session and keep it attached: every detach triggers a
    /// redial and reattach until the connection closes.
    pub async fn connect_with_redial<D: Dialer>(&self, dialer: D) -> io::Result<Connected> {
        let stream = dialer.dial().await?;
        match self.connect(stream, None, None).await? {
            Connected::Direct(stream) => Ok(Connected::Direct(stream)),
            Connected::Resumable(session) => {
                let client = self.clone();
                let conn = session.conn.clone();
                let token = session.token;
                tokio::spawn(async move {
                    client.supervise(conn, token, dialer).await;
                });
                Ok(Connected::Resumable(session))
            }
        }
    }

    async fn supervise<D: Dialer>(&self, conn: ResumableConn, token: ResumptionToken, dialer: D) {
        loop {
            conn.wait_detached().await;
            if conn.is_closed() {
                return;
            }
            debug!("session detached, redialing");
            match dialer.dial().await {
                Ok(stream) => {
                    if let Err(err) = self.reattach(&conn, token, stream).await {
                        debug!(error = %err, "reattach attempt failed");
                        tokio::time::sleep(REATTACH_RETRY_DELAY).await;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "redial failed");
                    tokio::time::sleep(REATTACH_RETRY_DELAY).await;
                }
            }
        }
    }
}
