//! Error taxonomy for the tunnel core.
//!
//! Configuration and resolution errors are fatal during startup; I/O
//! errors are split into recoverable (retried or swallowed by the data
//! plane) and non-recoverable (the owning worker exits); protocol
//! violations are logged and the offending message dropped.

use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration input (bad line, bad value).
    #[error("configuration error: {0}")]
    Config(String),

    /// A key the module cannot run without.
    #[error("missing required config key '{0}'")]
    ConfigMissing(String),

    /// Buffer allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Non-recoverable I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Remote host/port did not resolve to a usable address.
    #[error("address resolution failed for {0}")]
    Resolve(String),

    /// Peer-side protocol violation (malformed HTTP message, bad base64).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The module was asked to process data after stop().
    #[error("module is stopped")]
    Stopped,
}

impl Error {
    /// EAGAIN/EWOULDBLOCK/EINTR are expected under non-blocking I/O and
    /// never abort a worker.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io(err) => io_recoverable(err),
            _ => false,
        }
    }
}

/// Recoverable-I/O predicate shared by the fd helpers and transports.
pub fn io_recoverable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
