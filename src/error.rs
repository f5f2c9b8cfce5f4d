//! Error kinds surfaced by stream operations.

use std::io;

/// Why a read, write, or deadline call on a resumable connection failed.
///
/// `Closed` is terminal: every later call fails the same way. A crossed
/// deadline only fails the call that was waiting; the connection stays
/// usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("connection closed")]
    Closed,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl StreamError {
    /// Surface through `std::io::Error` so the stream traits can carry it.
    pub(crate) fn into_io(self) -> io::Error {
        let kind = match self {
            StreamError::Closed => io::ErrorKind::NotConnected,
            StreamError::DeadlineExceeded => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, self)
    }
}
