//! Timeout-bounded reads over a [`Client`].

use std::time::Duration;

use super::{Client, TransportError};
use crate::clock::Clock;

/// Incremental line and byte reader over a socket.
///
/// Waiting loops poll [`Client::available`] and call [`Clock::idle`] on
/// every empty iteration. The timeout measures inactivity: it restarts each
/// time a byte arrives. Nothing is buffered beyond the caller's buffers.
pub struct ByteStreamReader<'a> {
    client: &'a mut dyn Client,
    clock: &'a dyn Clock,
    timeout: Duration,
}

impl<'a> ByteStreamReader<'a> {
    /// Create a reader with the given inactivity timeout.
    pub fn new(client: &'a mut dyn Client, clock: &'a dyn Clock, timeout: Duration) -> Self {
        Self {
            client,
            clock,
            timeout,
        }
    }

    /// The inactivity timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait until at least one byte is readable.
    ///
    /// Returns the number of readable bytes.
    pub fn wait_for_data(&mut self) -> Result<usize, TransportError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let started = self.clock.now_millis();
        loop {
            let available = self.client.available();
            if available > 0 {
                return Ok(available);
            }
            if !self.client.connected() {
                return Err(TransportError::ConnectionLost);
            }
            if self.clock.now_millis().saturating_sub(started) >= timeout_ms {
                return Err(TransportError::ReadTimeout { millis: timeout_ms });
            }
            self.clock.idle();
        }
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        loop {
            self.wait_for_data()?;
            match self.client.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => self.clock.idle(),
                Err(_) => return Err(TransportError::ConnectionLost),
            }
        }
    }

    /// Read one line into `out`, without its `\n` or `\r\n` terminator.
    ///
    /// At most `max_len` bytes are stored; the rest of an over-long line is
    /// consumed and discarded. Returns the number of bytes stored.
    pub fn read_line(&mut self, out: &mut Vec<u8>, max_len: usize) -> Result<usize, TransportError> {
        out.clear();
        let mut truncated = false;
        loop {
            let byte = self.read_byte()?;
            if byte == b'\n' {
                break;
            }
            if out.len() < max_len {
                out.push(byte);
            } else {
                truncated = true;
            }
        }
        if out.last() == Some(&b'\r') && !truncated {
            out.pop();
        }
        if truncated {
            tracing::trace!("Discarded the tail of a line longer than {} bytes", max_len);
        }
        Ok(out.len())
    }

    /// Fill `buf` completely.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_available(&mut buf[filled..])?;
        }
        Ok(filled)
    }

    /// Wait for data and read whatever is available, up to `buf.len()`.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let available = self.wait_for_data()?;
            let want = available.min(buf.len());
            match self.client.read(&mut buf[..want]) {
                Ok(0) => self.clock.idle(),
                Ok(n) => return Ok(n),
                Err(_) => return Err(TransportError::ConnectionLost),
            }
        }
    }

    /// Read whatever is available without waiting.
    ///
    /// Returns `Ok(0)` when the socket is idle, and
    /// [`TransportError::ConnectionLost`] once it is closed and drained.
    pub fn poll(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let available = self.client.available();
        if available == 0 {
            return if self.client.connected() {
                Ok(0)
            } else {
                Err(TransportError::ConnectionLost)
            };
        }
        let want = available.min(buf.len());
        self.client
            .read(&mut buf[..want])
            .map_err(|_| TransportError::ConnectionLost)
    }
}
