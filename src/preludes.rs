//! Byte literals exchanged before framing begins.
//!
//! The downstream consumer owns the banner dialect; the resumption layer is
//! parameterized on these literals so it can sit in front of any
//! banner-first protocol. The stock values target a secure-shell style
//! handshake, where every client's first bytes are the shared version
//! prefix.

/// Single byte a client sends to open a brand-new session. A reattach sends
/// its 16-byte token instead, whose leading byte is never zero.
pub const NEW_SESSION_MARKER: u8 = 0x00;

/// The prelude literals for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preludes {
    /// Leading bytes every client of the dialect emits (e.g. `SSH-2.0-`).
    pub banner_prefix: Vec<u8>,
    /// Full server banner, without the trailing CRLF. Carries the
    /// resume-capable marker a plain server would never send.
    pub server_banner: Vec<u8>,
    /// Resume-capable client suffix. Contains a NUL, which no banner dialect
    /// emits, so a plain client can never be mistaken for a resuming one.
    pub client_suffix: Vec<u8>,
}

impl Preludes {
    /// Stock secure-shell flavor.
    pub fn ssh() -> Self {
        Self {
            banner_prefix: b"SSH-2.0-".to_vec(),
            server_banner: b"SSH-2.0-Tether resume-v1".to_vec(),
            client_suffix: b"\x00tether-resume-v1".to_vec(),
        }
    }

    /// What a resume-capable server sends first: banner plus CRLF.
    pub fn server_prelude(&self) -> Vec<u8> {
        let mut prelude = self.server_banner.clone();
        prelude.extend_from_slice(b"\r\n");
        prelude
    }

    /// What a resume-capable client sends first: prefix plus suffix.
    pub fn client_prelude(&self) -> Vec<u8> {
        let mut prelude = self.banner_prefix.clone();
        prelude.extend_from_slice(&self.client_suffix);
        prelude
    }
}

impl Default for Preludes {
    fn default() -> Self {
        Self::ssh()
    }
}
