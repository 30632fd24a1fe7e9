//! In-memory scripted client.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Client;

/// Scripted server reply released by the next request write.
///
/// Segments become readable one at a time, which lets tests reproduce
/// replies split at arbitrary byte boundaries.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    segments: VecDeque<Vec<u8>>,
    close_when_drained: bool,
}

impl Exchange {
    /// Create an empty reply.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with a single segment.
    pub fn response(bytes: impl AsRef<[u8]>) -> Self {
        Self::new().segment(bytes)
    }

    /// Reply with `bytes` delivered in pieces of at most `size` bytes.
    pub fn split_every(bytes: impl AsRef<[u8]>, size: usize) -> Self {
        let size = size.max(1);
        bytes
            .as_ref()
            .chunks(size)
            .fold(Self::new(), |exchange, piece| exchange.segment(piece))
    }

    /// Append a segment.
    pub fn segment(mut self, bytes: impl AsRef<[u8]>) -> Self {
        let bytes = bytes.as_ref();
        if !bytes.is_empty() {
            self.segments.push_back(bytes.to_vec());
        }
        self
    }

    /// Hang up once every segment has been read.
    pub fn then_close(mut self) -> Self {
        self.close_when_drained = true;
        self
    }

    fn drained(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    scripted: VecDeque<Exchange>,
    current: Option<Exchange>,
    connected: bool,
    refuse: usize,
    written: Vec<u8>,
    connects: Vec<(String, u16)>,
}

impl MemoryState {
    fn hung_up(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|e| e.close_when_drained && e.drained())
    }
}

/// In-memory [`Client`] for testing and replaying captured traffic.
///
/// Each request write releases the next scripted [`Exchange`]. Cloning
/// yields a handle onto the same state, so tests can inspect what was
/// written after handing the client to a component.
#[derive(Clone, Default)]
pub struct MemoryClient {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryClient {
    /// Create a client with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted reply.
    pub fn push(&self, exchange: Exchange) {
        self.state.lock().scripted.push_back(exchange);
    }

    /// Queue a scripted reply and return the client.
    pub fn with(self, exchange: Exchange) -> Self {
        self.push(exchange);
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse = count;
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// Every byte written so far, lossily decoded as UTF-8.
    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().written).into_owned()
    }

    /// Hosts and ports passed to `connect`, in order.
    pub fn connections(&self) -> Vec<(String, u16)> {
        self.state.lock().connects.clone()
    }

    /// Number of scripted replies not yet released.
    pub fn pending_exchanges(&self) -> usize {
        self.state.lock().scripted.len()
    }
}

impl std::fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryClient")
            .field("connected", &state.connected)
            .field("scripted", &state.scripted.len())
            .field("written_len", &state.written.len())
            .finish()
    }
}

impl Client for MemoryClient {
    fn connect(&mut self, host: &str, port: u16) -> io::Result<()> {
        let mut state = self.state.lock();
        state.connects.push((host.to_string(), port));
        if state.refuse > 0 {
            state.refuse -= 1;
            state.connected = false;
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        state.connected = true;
        state.current = None;
        Ok(())
    }

    fn connected(&self) -> bool {
        let state = self.state.lock();
        state.connected && !state.hung_up()
    }

    fn available(&mut self) -> usize {
        let state = self.state.lock();
        if !state.connected {
            return 0;
        }
        state
            .current
            .as_ref()
            .and_then(|e| e.segments.front())
            .map_or(0, Vec::len)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let Some(exchange) = state.current.as_mut() else {
            return Ok(0);
        };
        let Some(front) = exchange.segments.front_mut() else {
            return Ok(0);
        };
        let n = buf.len().min(front.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            exchange.segments.pop_front();
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if !state.connected || state.hung_up() {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        state.written.extend_from_slice(buf);
        if state.current.as_ref().is_none_or(Exchange::drained) {
            state.current = state.scripted.pop_front();
        }
        Ok(buf.len())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.current = None;
    }
}
