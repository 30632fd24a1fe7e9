//! Plain TCP client.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::Client;

const PEEK_WINDOW: usize = 1024;

/// [`Client`] over a non-blocking [`TcpStream`].
///
/// Useful against local emulators and behind TLS-terminating proxies.
#[derive(Debug)]
pub struct TcpClient {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    write_timeout: Duration,
    closed_by_peer: bool,
}

impl TcpClient {
    /// Create a disconnected client.
    pub fn new() -> Self {
        Self {
            stream: None,
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            closed_by_peer: false,
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long a write may wait for room in the send buffer.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Client for TcpClient {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        self.stop();
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for host"))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}:{}", host, port);
        self.stream = Some(stream);
        self.closed_by_peer = false;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.stream.is_some() && !self.closed_by_peer
    }

    fn available(&mut self) -> usize {
        let Some(stream) = self.stream.as_ref() else {
            return 0;
        };
        let mut window = [0u8; PEEK_WINDOW];
        match stream.peek(&mut window) {
            Ok(0) => {
                self.closed_by_peer = true;
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                tracing::debug!("Socket peek failed: {}", e);
                self.closed_by_peer = true;
                0
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.closed_by_peer = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let deadline = Instant::now() + self.write_timeout;
        loop {
            match stream.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        tracing::debug!("Send buffer stayed full for {:?}", self.write_timeout);
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
                    }
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!("Connection closed");
        }
        self.closed_by_peer = false;
    }
}
