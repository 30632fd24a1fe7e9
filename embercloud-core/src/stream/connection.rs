//! A long-lived event-stream request.

use std::time::Duration;

use super::{EventStreamFramer, StreamSignal};
use crate::http::{status_text, ChunkedBodyDecoder, HttpError, HttpSession, Request};
use crate::transport::{Client, TransportError};

/// Supplies the `auth` query value for each (re)connect.
pub type AuthQuery = Box<dyn Fn() -> Option<String> + Send>;

/// Socket reads performed per [`StreamConnection::poll`] before yielding.
const READS_PER_POLL: usize = 16;

/// Build the `GET <path>.json` event-stream request.
pub fn stream_request(host: &str, path: &str, auth: Option<&str>) -> Request {
    let trimmed = path.trim_matches('/');
    let mut target = format!("/{trimmed}.json");
    if let Some(token) = auth {
        target.push_str("?auth=");
        target.push_str(token);
    }
    Request::get(host, target).event_stream()
}

/// A subscription to one database path.
///
/// [`poll`](Self::poll) never waits for data: it drains what the socket
/// has, pushes it through the chunked decoder (when the server chunks the
/// body) and the framer, and returns the completed signals.
pub struct StreamConnection<C: Client> {
    session: HttpSession<C>,
    host: String,
    port: u16,
    path: String,
    auth: Option<AuthQuery>,
    framer: EventStreamFramer,
    decoder: Option<ChunkedBodyDecoder>,
    open: bool,
    buf: Vec<u8>,
    decoded: Vec<u8>,
}

impl<C: Client> StreamConnection<C> {
    /// Create an unopened subscription to `path` on `host`.
    pub fn new(session: HttpSession<C>, host: impl Into<String>, path: impl Into<String>) -> Self {
        let now = session.clock().now_millis();
        let buf_size = session.options().read_buffer_size.max(64);
        Self {
            session,
            host: host.into(),
            port: 443,
            path: path.into(),
            auth: None,
            framer: EventStreamFramer::new(now),
            decoder: None,
            open: false,
            buf: vec![0; buf_size],
            decoded: Vec::with_capacity(buf_size),
        }
    }

    /// Attach the credential used on every connect.
    pub fn with_auth(mut self, auth: AuthQuery) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Connect to `port` instead of 443.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the keep-alive timeout.
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.framer = self.framer.with_keep_alive_timeout(timeout);
        self
    }

    /// Subscribed path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path of the most recent data event.
    pub fn last_path(&self) -> Option<&str> {
        self.framer.last_path()
    }

    /// Whether the stream is open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The underlying session.
    pub fn session_mut(&mut self) -> &mut HttpSession<C> {
        &mut self.session
    }

    /// Open (or reopen) the subscription.
    pub fn connect(&mut self) -> Result<(), HttpError> {
        self.close();
        let token = self.auth.as_ref().and_then(|auth| auth());
        let request = stream_request(&self.host, &self.path, token.as_deref()).with_port(self.port);
        let state = self.session.open(&request)?;
        if !state.is_success() {
            self.session.close();
            return Err(HttpError::Server {
                status: state.http_code,
                message: status_text(state.http_code).to_string(),
            });
        }
        self.decoder = state.chunked.then(ChunkedBodyDecoder::new);
        self.framer.reset(self.session.clock().now_millis());
        self.open = true;
        tracing::info!("Stream connected to {}:{} at {}", self.host, self.port, self.path);
        Ok(())
    }

    /// Close the subscription.
    pub fn close(&mut self) {
        if self.open {
            tracing::debug!("Closing stream at {}", self.path);
        }
        self.open = false;
        self.decoder = None;
        self.session.close();
    }

    /// Drain readable bytes and return completed signals.
    ///
    /// Any error closes the stream.
    pub fn poll(&mut self) -> Result<Vec<StreamSignal>, HttpError> {
        if !self.open {
            return Err(TransportError::NotConnected.into());
        }
        let result = self.drain();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn drain(&mut self) -> Result<Vec<StreamSignal>, HttpError> {
        let timeout = self.session.options().response_timeout;
        let now = self.session.clock().now_millis();
        let mut signals = Vec::new();

        for _ in 0..READS_PER_POLL {
            let polled = self.session.reader(timeout).poll(&mut self.buf);
            let n = match polled {
                Ok(0) => break,
                Ok(n) => n,
                // Hand over what already arrived; the next poll reports the
                // closed stream.
                Err(e) if !signals.is_empty() => {
                    tracing::debug!("Stream at {} ended: {}", self.path, e);
                    self.close();
                    return Ok(signals);
                }
                Err(e) => return Err(e.into()),
            };
            let body = match self.decoder.as_mut() {
                Some(decoder) => {
                    self.decoded.clear();
                    decoder.decode_into(&self.buf[..n], &mut self.decoded)?;
                    &self.decoded[..]
                }
                None => &self.buf[..n],
            };
            signals.extend(self.framer.feed(body, now));

            if self.decoder.as_ref().is_some_and(ChunkedBodyDecoder::is_done) {
                tracing::info!("Server ended the stream at {}", self.path);
                self.close();
                break;
            }
        }
        if let Some(timeout) = self.framer.poll_timeout(now) {
            signals.push(timeout);
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::{Clock, ManualClock};
    use crate::transport::{Exchange, MemoryClient};

    const HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n";

    fn connection(handle: &MemoryClient, clock: &ManualClock) -> StreamConnection<MemoryClient> {
        let session = HttpSession::new(handle.clone(), Arc::new(clock.clone()));
        StreamConnection::new(session, "db.example.com", "/sensors")
    }

    #[test]
    fn test_stream_request_path() {
        let request = stream_request("h", "/", Some("tok"));
        assert_eq!(request.path, "/.json?auth=tok");
        assert_eq!(stream_request("h", "a/b/", None).path, "/a/b.json");
    }

    #[test]
    fn test_raw_body_events() {
        let handle = MemoryClient::new().with(
            Exchange::new()
                .segment(HEAD)
                .segment("event: put\r\ndata: {\"path\":\"/\",\"data\":{\"t\":21.5}}\r\n")
                .segment("\r\nevent: keep-alive\r\ndata: null\r\n\r\n"),
        );
        let clock = ManualClock::new(0);
        let mut stream = connection(&handle, &clock).with_auth(Box::new(|| Some("secret".into())));
        stream.connect().unwrap();
        assert!(handle.written_string().contains("GET /sensors.json?auth=secret HTTP/1.1"));
        assert!(handle.written_string().contains("Accept: text/event-stream"));
        assert_eq!(handle.connections(), vec![("db.example.com".to_string(), 443)]);

        let signals = stream.poll().unwrap();
        assert_eq!(signals.len(), 2);
        assert!(matches!(&signals[0], StreamSignal::Event(e) if e.path == "/"));
        assert_eq!(signals[1], StreamSignal::KeepAlive);
        assert!(stream.poll().unwrap().is_empty());
    }

    #[test]
    fn test_chunked_body_events() {
        let frame = "event: put\ndata: {\"path\":\"/x\",\"data\":true}\n\n";
        let body = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
            frame.len(),
            frame
        );
        let handle = MemoryClient::new().with(Exchange::split_every(body, 9));
        let clock = ManualClock::new(0);
        let mut stream = connection(&handle, &clock);
        stream.connect().unwrap();

        let mut signals = Vec::new();
        for _ in 0..20 {
            signals.extend(stream.poll().unwrap());
        }
        assert_eq!(signals.len(), 1);
        assert_eq!(stream.last_path(), Some("/x"));
    }

    #[test]
    fn test_timeout_signal() {
        let handle = MemoryClient::new().with(Exchange::response(HEAD));
        let clock = ManualClock::new(0);
        let mut stream =
            connection(&handle, &clock).with_keep_alive_timeout(Duration::from_secs(20));
        stream.connect().unwrap();

        clock.advance(Duration::from_secs(21));
        assert_eq!(stream.poll().unwrap(), vec![StreamSignal::Timeout]);
        assert!(stream.is_open());
    }

    #[test]
    fn test_server_hangup_is_an_error() {
        let handle = MemoryClient::new().with(
            Exchange::new()
                .segment(HEAD)
                .segment("event: keep-alive\ndata: null\n\n")
                .then_close(),
        );
        let clock = ManualClock::new(0);
        let mut stream = connection(&handle, &clock);
        stream.connect().unwrap();

        assert_eq!(stream.poll().unwrap(), vec![StreamSignal::KeepAlive]);
        assert!(!stream.is_open());
        assert_eq!(
            stream.poll().unwrap_err(),
            HttpError::Transport(TransportError::NotConnected)
        );
    }

    #[test]
    fn test_unauthorized_stream() {
        let handle = MemoryClient::new().with(Exchange::response(
            "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n",
        ));
        let clock = ManualClock::new(0);
        let mut stream = connection(&handle, &clock);
        let err = stream.connect().unwrap_err();
        assert_eq!(err.code(), 401);
        assert!(!stream.is_open());
        assert_eq!(clock.now_millis(), 0);
    }
}
