//! Byte-stream transport abstraction.
//!
//! This module provides:
//! - [`Client`] - The socket collaborator (`connect/connected/available/read/write/stop`)
//! - [`TcpClient`] - A plain TCP implementation for hosts and emulators
//! - [`MemoryClient`] - A scripted in-memory implementation for testing
//! - [`ByteStreamReader`] - Timeout-bounded line and byte reads over a client
//! - [`ConnectionLock`] - The single-connection reservation guard
//!
//! TLS is never performed here; a `Client` is assumed to already provide an
//! encrypted channel when one is required.

use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::code;

mod memory;
mod reader;
mod tcp;

pub use memory::{Exchange, MemoryClient};
pub use reader::ByteStreamReader;
pub use tcp::TcpClient;

/// Error type for socket-level failures.
///
/// All variants are terminal for the current request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server refused the connection.
    #[error("connection refused by {host}:{port}")]
    ConnectionRefused { host: String, port: u16 },

    /// Writing the request line or headers failed.
    #[error("send request header failed")]
    SendHeaderFailed,

    /// Writing the request body failed.
    #[error("send request payload failed")]
    SendPayloadFailed,

    /// The operation needs an open connection.
    #[error("not connected")]
    NotConnected,

    /// The socket reported disconnected mid-read.
    #[error("connection lost")]
    ConnectionLost,

    /// No bytes arrived within the response timeout.
    #[error("response read timed out after {millis} ms")]
    ReadTimeout { millis: u64 },

    /// The redirect chain exceeded the configured maximum.
    #[error("maximum redirects ({max}) exceeded")]
    MaxRedirects { max: u8 },

    /// Another request currently holds the connection.
    #[error("connection in use")]
    ConnectionInUse,

    /// A redirect carried an unusable `Location`.
    #[error("invalid redirect location: {location}")]
    InvalidRedirect { location: String },
}

impl TransportError {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectionRefused { .. } => code::CONNECTION_REFUSED,
            Self::SendHeaderFailed => code::SEND_HEADER_FAILED,
            Self::SendPayloadFailed => code::SEND_PAYLOAD_FAILED,
            Self::NotConnected => code::NOT_CONNECTED,
            Self::ConnectionLost => code::CONNECTION_LOST,
            Self::ReadTimeout { .. } => code::READ_TIMEOUT,
            Self::MaxRedirects { .. } => code::MAX_REDIRECTS,
            Self::ConnectionInUse => code::CONNECTION_IN_USE,
            Self::InvalidRedirect { .. } => code::INVALID_REDIRECT,
        }
    }
}

/// Byte-stream socket collaborator.
///
/// Implementations must never block indefinitely in [`read`](Client::read):
/// callers only read what [`available`](Client::available) reported.
pub trait Client: Send {
    /// Open a connection to `host:port`.
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()>;

    /// Whether the connection is still open.
    fn connected(&self) -> bool;

    /// Number of bytes that can be read without blocking.
    fn available(&mut self) -> usize;

    /// Read up to `buf.len()` bytes. Returns the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf`. Returns the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the connection.
    fn stop(&mut self);
}

impl<C: Client + ?Sized> Client for Box<C> {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        (**self).connect(host, port)
    }

    fn connected(&self) -> bool {
        (**self).connected()
    }

    fn available(&mut self) -> usize {
        (**self).available()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Write the whole buffer, mapping short writes to `failure`.
pub(crate) fn write_all(
    client: &mut dyn Client,
    mut buf: &[u8],
    failure: TransportError,
) -> Result<(), TransportError> {
    if !client.connected() {
        return Err(TransportError::NotConnected);
    }
    while !buf.is_empty() {
        match client.write(buf) {
            Ok(0) | Err(_) => return Err(failure),
            Ok(n) => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Exclusive reservation of a shared connection.
///
/// Two requests must never interleave on one socket: a second
/// [`try_reserve`](ConnectionLock::try_reserve) while the first permit is
/// alive fails fast with [`TransportError::ConnectionInUse`]. Dropping the
/// permit is the only way to release the reservation.
pub struct ConnectionLock<C> {
    inner: Arc<Mutex<C>>,
}

/// Guard proving ownership of a reserved connection.
pub type ConnectionPermit<'a, C> = MutexGuard<'a, C>;

impl<C> ConnectionLock<C> {
    /// Wrap a connection.
    pub fn new(client: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(client)),
        }
    }

    /// Reserve the connection or fail immediately if it is in use.
    pub fn try_reserve(&self) -> Result<ConnectionPermit<'_, C>, TransportError> {
        self.inner.try_lock().ok_or(TransportError::ConnectionInUse)
    }

    /// Whether a request currently holds the connection.
    pub fn is_reserved(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<C> Clone for ConnectionLock<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> std::fmt::Debug for ConnectionLock<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLock")
            .field("reserved", &self.is_reserved())
            .finish()
    }
}
