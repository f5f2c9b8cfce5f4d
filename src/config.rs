//! Transport tunables.
//!
//! TOML is the config source; the `[transport]` table is optional and every
//! field in it has a default, so an empty document yields the stock sizing.
//!
//! # Fields
//! - `transport.buffer_size`: per-direction buffer capacity in bytes
//! - `transport.max_frame`: largest single frame payload in bytes
//! - `transport.detach_timeout_ms`: grace window after a detach

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024;
pub const DEFAULT_DETACH_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Validated config
// ---------------------------------------------------------------------------

/// Sizing and timing knobs for the resumable transport.
///
/// Both endpoints should agree on `buffer_size` and `max_frame`; a receiver
/// enforces its own limits against whatever the peer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Capacity of the receive buffer and of the replay buffer, in bytes.
    pub buffer_size: usize,
    /// Largest payload carried by one frame, in bytes.
    pub max_frame: usize,
    /// How long a detached connection waits for a reattach before closing.
    pub detach_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame: DEFAULT_MAX_FRAME,
            detach_timeout: DEFAULT_DETACH_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(&'static str),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    transport: Option<RawTransport>,
}

#[derive(Debug, Deserialize)]
struct RawTransport {
    buffer_size: Option<usize>,
    max_frame: Option<usize>,
    detach_timeout_ms: Option<u64>,
}

impl TransportConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let transport = raw.transport.unwrap_or(RawTransport {
            buffer_size: None,
            max_frame: None,
            detach_timeout_ms: None,
        });
        Self {
            buffer_size: transport.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE),
            max_frame: transport.max_frame.unwrap_or(DEFAULT_MAX_FRAME),
            detach_timeout: transport
                .detach_timeout_ms
                .map_or(DEFAULT_DETACH_TIMEOUT, Duration::from_millis),
        }
        .validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("transport.buffer_size must be positive"));
        }
        if self.max_frame == 0 {
            return Err(ConfigError::Invalid("transport.max_frame must be positive"));
        }
        if self.max_frame > self.buffer_size {
            return Err(ConfigError::Invalid(
                "transport.max_frame cannot exceed transport.buffer_size",
            ));
        }
        if self.detach_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "transport.detach_timeout_ms must be positive",
            ));
        }
        Ok(self)
    }
}
