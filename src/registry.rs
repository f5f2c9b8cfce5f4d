//! Token registry: the server-side map from resumption token to live
//! connection.
//!
//! Owned by the server value (dependency-injected, not a process global) so
//! tests can run isolated instances side by side. Entries appear when a new
//! resumable session is established and disappear when the connection
//! closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::conn::ResumableConn;

/// Length of a resumption token on the wire.
pub const TOKEN_LEN: usize = 16;

/// Opaque 16-byte resumption token.
///
/// The leading byte is never zero, so the first token byte on the wire is
/// unambiguous against the single zero byte that marks a new session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResumptionToken([u8; TOKEN_LEN]);

impl ResumptionToken {
    /// Mint a fresh random token with a nonzero leading byte.
    pub fn generate() -> Self {
        loop {
            let bytes = *uuid::Uuid::new_v4().as_bytes();
            if bytes[0] != 0 {
                return Self(bytes);
            }
        }
    }

    /// Accept a token off the wire; rejects a zero leading byte.
    pub fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Option<Self> {
        (bytes[0] != 0).then_some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl fmt::Debug for ResumptionToken {
    // Tokens are bearer credentials; never print more than a stub.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumptionToken({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Concurrent token → connection map.
///
/// The registry holds one shared handle per entry; whoever received the
/// connection from the handshake shim holds the others. Removal happens
/// automatically once the connection closes.
#[derive(Clone, Default)]
pub struct ConnRegistry {
    conns: Arc<RwLock<HashMap<ResumptionToken, ResumableConn>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection and schedule its removal at close.
    pub async fn register(&self, token: ResumptionToken, conn: ResumableConn) {
        self.conns.write().await.insert(token, conn.clone());
        let registry = self.clone();
        tokio::spawn(async move {
            conn.wait_closed().await;
            registry.conns.write().await.remove(&token);
        });
    }

    pub async fn lookup(&self, token: &ResumptionToken) -> Option<ResumableConn> {
        self.conns.read().await.get(token).cloned()
    }

    pub async fn len(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conns.read().await.is_empty()
    }
}
