//! tether: a resumable byte-stream transport.
//!
//! A [`ResumableConn`] is a durable, bidirectional byte stream that survives
//! failures of the physical transport underneath it. Writes are retained in
//! a replay buffer until the peer confirms them; after a reconnect the two
//! sides exchange positions, replay whatever went missing, and carry on with
//! no loss, duplication, or reordering. Readers and writers never observe
//! the churn: they block (in the async sense) until bytes flow again, a
//! deadline passes, or the connection is closed for good.
//!
//! The [`server`] and [`client`] shims splice this in front of an unmodified
//! banner-first protocol: peers that do not speak the resumption prelude get
//! a plain byte stream and never know the layer exists.

pub mod client;
pub mod config;
pub mod conn;
mod driver;
pub mod error;
pub mod preludes;
pub mod registry;
pub mod server;

pub use client::{Connected, Dialer, ResumableClient, ResumableSession, TcpDialer};
pub use config::TransportConfig;
pub use conn::ResumableConn;
pub use error::StreamError;
pub use preludes::{NEW_SESSION_MARKER, Preludes};
pub use registry::{ConnRegistry, ResumptionToken, TOKEN_LEN};
pub use server::{ConnectionHandler, ResumableServer};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte stream usable as a physical transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// Owned trait-object stream, as handed to [`ConnectionHandler`]s.
pub type BoxedStream = Box<dyn RawStream>;
