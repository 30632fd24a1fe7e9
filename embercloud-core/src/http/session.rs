//! Request/response exchange over a single reusable connection.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use url::Url;

use super::{ChunkedBodyDecoder, HttpError, Method, Request, ResponseHeaderParser, ResponseState};
use crate::clock::Clock;
use crate::transport::{ByteStreamReader, Client, TransportError};

const SNIFF_LIMIT: usize = 1024;

/// Tunables for an [`HttpSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Inactivity timeout while waiting for response bytes.
    pub response_timeout: Duration,
    /// Redirects followed before the request fails.
    pub max_redirects: u8,
    /// Longest header line kept; longer lines are truncated.
    pub max_header_line: usize,
    /// Size of the scratch buffer used for body reads.
    pub read_buffer_size: usize,
    /// Largest body accepted by [`HttpSession::send`].
    pub max_body_size: usize,
    /// When set, a body read idle for this long ends the body successfully.
    pub idle_cutoff: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            max_redirects: 5,
            max_header_line: 1024,
            read_buffer_size: 1024,
            max_body_size: 4 * 1024 * 1024,
            idle_cutoff: None,
        }
    }
}

impl SessionOptions {
    /// Set the response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the redirect limit.
    pub fn with_max_redirects(mut self, max: u8) -> Self {
        self.max_redirects = max;
        self
    }

    /// Treat a body idle for `cutoff` as complete.
    pub fn with_idle_cutoff(mut self, cutoff: Duration) -> Self {
        self.idle_cutoff = Some(cutoff);
        self
    }

    /// Set the body size limit.
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }
}

/// Host and port of the currently open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub state: ResponseState,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Status code.
    pub fn status(&self) -> u16 {
        self.state.http_code
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Fail with [`HttpError::Server`] on a non-2xx status or an error body.
    pub fn check(self) -> Result<Self, HttpError> {
        if self.state.is_success() && self.state.server_error_message.is_none() {
            return Ok(self);
        }
        let status = self.state.http_code;
        let message = self
            .state
            .server_error_message
            .unwrap_or_else(|| super::status_text(status).to_string());
        Err(HttpError::Server { status, message })
    }
}

/// One reusable connection plus the pipeline that reads responses from it.
///
/// At most one request is in flight on a session; exclusive access is
/// enforced by `&mut self`, and callers sharing a session across threads
/// wrap it in a [`ConnectionLock`](crate::transport::ConnectionLock).
/// Every failure closes the connection, so decoder state never leaks into
/// the next request.
pub struct HttpSession<C: Client> {
    client: C,
    clock: Arc<dyn Clock>,
    options: SessionOptions,
    endpoint: Option<Endpoint>,
}

impl<C: Client> HttpSession<C> {
    /// Create a session over `client`.
    pub fn new(client: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            clock,
            options: SessionOptions::default(),
            endpoint: None,
        }
    }

    /// Replace the session options.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Current options.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The endpoint of the open connection, if any.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref().filter(|_| self.client.connected())
    }

    /// The session clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Borrow the underlying client.
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    /// Consume the session, returning the client.
    pub fn into_client(self) -> C {
        self.client
    }

    /// A reader over the open connection.
    pub fn reader(&mut self, timeout: Duration) -> ByteStreamReader<'_> {
        ByteStreamReader::new(&mut self.client, self.clock.as_ref(), timeout)
    }

    /// Close the connection.
    pub fn close(&mut self) {
        if self.endpoint.take().is_some() {
            tracing::debug!("Closing connection");
        }
        self.client.stop();
    }

    /// Send a request and read the full response body.
    pub fn send(&mut self, request: &Request) -> Result<HttpResponse, HttpError> {
        let mut body = Vec::new();
        let limit = self.options.max_body_size;
        let state = self.send_streaming(request, &mut |bytes: &[u8]| {
            if body.len() + bytes.len() > limit {
                return Err(HttpError::BodyTooLarge { limit });
            }
            body.extend_from_slice(bytes);
            Ok(())
        })?;
        Ok(HttpResponse { state, body })
    }

    /// Send a request, handing decoded body bytes to `on_body` as they
    /// arrive.
    pub fn send_streaming(
        &mut self,
        request: &Request,
        on_body: &mut dyn FnMut(&[u8]) -> Result<(), HttpError>,
    ) -> Result<ResponseState, HttpError> {
        let result = self.exchange(request, on_body);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn exchange(
        &mut self,
        request: &Request,
        on_body: &mut dyn FnMut(&[u8]) -> Result<(), HttpError>,
    ) -> Result<ResponseState, HttpError> {
        let mut state = self.open_inner(request)?;
        // Only the head of the body is kept for error and push-name sniffing.
        let mut head = Vec::new();
        self.read_body(&state, request.method, &mut |bytes: &[u8]| {
            if head.len() < SNIFF_LIMIT {
                head.extend_from_slice(bytes);
            }
            on_body(bytes)
        })?;
        state.inspect_body(&head);
        if state.closes_connection() || !request.keep_alive {
            self.close();
        }
        Ok(state)
    }

    /// Send a request and read only the response header.
    ///
    /// Redirects are followed. The body is left on the connection for the
    /// caller, which is how event streams are consumed.
    pub fn open(&mut self, request: &Request) -> Result<ResponseState, HttpError> {
        let result = self.open_inner(request);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn open_inner(&mut self, request: &Request) -> Result<ResponseState, HttpError> {
        let mut current = Cow::Borrowed(request);
        let mut redirects = 0u8;
        loop {
            self.ensure_connected(&current.host, current.port)?;
            current.write_to(&mut self.client)?;
            let state = self.read_header()?;

            if !state.is_redirect() {
                return Ok(state);
            }
            if redirects >= self.options.max_redirects {
                tracing::warn!("Giving up after {} redirects", redirects);
                return Err(TransportError::MaxRedirects {
                    max: self.options.max_redirects,
                }
                .into());
            }
            let location = state.location.clone().unwrap_or_default();
            let next = redirect_target(&current, &location)?;
            redirects += 1;
            tracing::debug!(
                "Following redirect {} to {}:{}",
                redirects,
                next.host,
                next.port
            );
            // The redirect body is never read; dropping the connection
            // discards it.
            self.close();
            current = Cow::Owned(next);
        }
    }

    /// Connect to `host:port` unless the open connection already points there.
    pub fn ensure_connected(&mut self, host: &str, port: u16) -> Result<(), TransportError> {
        let reusable = self.client.connected()
            && self
                .endpoint
                .as_ref()
                .is_some_and(|e| e.host == host && e.port == port);
        if reusable {
            tracing::trace!("Reusing connection to {}:{}", host, port);
            return Ok(());
        }
        self.close();
        tracing::debug!("Connecting to {}:{}", host, port);
        self.client.connect(host, port).map_err(|e| {
            tracing::warn!("Connection to {}:{} failed: {}", host, port, e);
            TransportError::ConnectionRefused {
                host: host.to_string(),
                port,
            }
        })?;
        self.endpoint = Some(Endpoint {
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    fn read_header(&mut self) -> Result<ResponseState, HttpError> {
        let max_line = self.options.max_header_line;
        let timeout = self.options.response_timeout;
        let mut reader = self.reader(timeout);
        let mut parser = ResponseHeaderParser::new();
        let mut line = Vec::with_capacity(128);
        loop {
            reader.read_line(&mut line, max_line)?;
            if parser.feed_line(&line)? {
                break;
            }
        }
        let state = parser.into_state();
        tracing::trace!(
            "Response {} (length {:?}, chunked {})",
            state.http_code,
            state.content_length,
            state.chunked
        );
        Ok(state)
    }

    /// Read the body announced by `state`.
    pub fn read_body(
        &mut self,
        state: &ResponseState,
        method: Method,
        on_body: &mut dyn FnMut(&[u8]) -> Result<(), HttpError>,
    ) -> Result<(), HttpError> {
        if method.has_empty_response() || matches!(state.http_code, 204 | 304) {
            return Ok(());
        }
        let idle_cutoff = self.options.idle_cutoff;
        let timeout = idle_cutoff.unwrap_or(self.options.response_timeout);
        let mut buf = vec![0u8; self.options.read_buffer_size.max(64)];

        if state.chunked {
            let mut decoder = ChunkedBodyDecoder::new();
            let mut decoded = Vec::with_capacity(buf.len());
            let mut hung_up = false;
            let mut reader = self.reader(timeout);
            while !decoder.is_done() {
                let n = match body_read(&mut reader, &mut buf, idle_cutoff.is_some()) {
                    Ok(Some(n)) => n,
                    Ok(None) => return Ok(()),
                    // The final CRLF after the zero-size chunk is optional.
                    Err(HttpError::Transport(TransportError::ConnectionLost))
                        if decoder.finish().is_ok() =>
                    {
                        tracing::debug!("Server closed after the final chunk");
                        hung_up = true;
                        break;
                    }
                    Err(e) => return Err(e),
                };
                decoded.clear();
                decoder.decode_into(&buf[..n], &mut decoded)?;
                if !decoded.is_empty() {
                    on_body(&decoded)?;
                }
            }
            if hung_up {
                self.close();
            }
            return Ok(());
        }

        if let Some(length) = state.content_length {
            let mut remaining = length;
            let mut reader = self.reader(timeout);
            while remaining > 0 {
                let want = remaining.min(buf.len());
                let n = match body_read(&mut reader, &mut buf[..want], idle_cutoff.is_some())? {
                    Some(n) => n,
                    None => return Ok(()),
                };
                remaining -= n;
                on_body(&buf[..n])?;
            }
            return Ok(());
        }

        // Neither length nor chunking: the body ends when the server hangs up.
        let mut reader = self.reader(timeout);
        loop {
            match reader.read_available(&mut buf) {
                Ok(n) => on_body(&buf[..n])?,
                Err(TransportError::ConnectionLost) => break,
                Err(TransportError::ReadTimeout { .. }) if idle_cutoff.is_some() => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.close();
        Ok(())
    }
}

/// Read body bytes, mapping an idle timeout to end-of-body when allowed.
fn body_read(
    reader: &mut ByteStreamReader<'_>,
    buf: &mut [u8],
    idle_is_eof: bool,
) -> Result<Option<usize>, HttpError> {
    match reader.read_available(buf) {
        Ok(n) => Ok(Some(n)),
        Err(TransportError::ReadTimeout { millis }) if idle_is_eof => {
            tracing::debug!("Body idle for {} ms, treating as complete", millis);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Build the follow-up request for a `Location` header.
fn redirect_target(request: &Request, location: &str) -> Result<Request, TransportError> {
    let invalid = || TransportError::InvalidRedirect {
        location: location.to_string(),
    };
    let mut next = request.clone();
    match Url::parse(location) {
        Ok(url) => {
            next.host = url.host_str().ok_or_else(invalid)?.to_string();
            next.port = url.port_or_known_default().ok_or_else(invalid)?;
            next.path = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
        }
        Err(url::ParseError::RelativeUrlWithoutBase) if location.starts_with('/') => {
            next.path = location.to_string();
        }
        Err(_) => return Err(invalid()),
    }
    Ok(next)
}
