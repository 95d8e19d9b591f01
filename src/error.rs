//! Error types for rcbroker.

use std::io;

/// Broker operation errors.
///
/// Setup-time failures (memory registration, queue-pair creation, work
/// request submission) are unrecoverable: the broker has no path to repair
/// or rebuild a broken queue pair, and callers are expected to abort.
/// Transient handshake failures never surface here; they are absorbed by
/// the retry loop in [`crate::retry::RetryPolicy`].
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying transport.
    Io(io::Error),
    /// Invalid broker configuration.
    InvalidConfig(String),
    /// No queue pair exists for the given server id.
    PeerNotFound(u32),
    /// The queue pair for this peer has not been connected yet.
    NotConnected(u32),
    /// Memory registration with the device failed.
    RegistrationFailed(u64),
    /// The hardware rejected a work request submission.
    SubmitFailed(i32),
    /// The arena is too small for the configured peer regions.
    ArenaTooSmall { required: usize, available: usize },
    /// Retry budget exhausted during connection establishment.
    RetriesExhausted(u32),
    /// Connection establishment was cancelled.
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::PeerNotFound(id) => write!(f, "No queue pair for server {}", id),
            Error::NotConnected(id) => write!(f, "Queue pair for server {} not connected", id),
            Error::RegistrationFailed(id) => {
                write!(f, "Memory registration failed for memory id {}", id)
            }
            Error::SubmitFailed(code) => write!(f, "Work request submission failed: {}", code),
            Error::ArenaTooSmall {
                required,
                available,
            } => write!(
                f,
                "Arena too small: required {} bytes, available {} bytes",
                required, available
            ),
            Error::RetriesExhausted(n) => write!(f, "Retries exhausted after {} attempts", n),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for rcbroker operations.
pub type Result<T> = std::result::Result<T, Error>;
