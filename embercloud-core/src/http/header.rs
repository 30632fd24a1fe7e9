//! Status line and known-header extraction.

use super::{ConnectionType, HttpError, ResponseState};

/// Line-fed parser for the response header block.
///
/// Only `Content-Length`, `Transfer-Encoding`, `Connection`, `ETag` and
/// `Location` are kept; every other header is ignored.
#[derive(Debug, Default)]
pub struct ResponseHeaderParser {
    state: ResponseState,
}

impl ResponseHeaderParser {
    /// Create a parser for a fresh response.
    pub fn new() -> Self {
        Self::default()
    }

    /// The facts gathered so far.
    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    /// Consume the parser, returning the gathered facts.
    pub fn into_state(self) -> ResponseState {
        self.state
    }

    /// Whether the blank line ending the header block has been seen.
    pub fn is_complete(&self) -> bool {
        self.state.header_complete
    }

    /// Feed one header line without its terminator.
    ///
    /// Returns `true` once the header block is complete.
    pub fn feed_line(&mut self, line: &[u8]) -> Result<bool, HttpError> {
        if self.state.header_complete {
            return Ok(true);
        }
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');

        if !self.state.header_parsed {
            // Tolerate stray blank lines left over from a previous body.
            if line.trim().is_empty() {
                return Ok(false);
            }
            self.state.http_code = parse_status_line(line)?;
            self.state.header_parsed = true;
            return Ok(false);
        }

        if line.is_empty() {
            if self.state.http_code == 100 {
                tracing::trace!("Skipping interim 100 Continue response");
                self.state = ResponseState::default();
                return Ok(false);
            }
            self.state.header_complete = true;
            if self.state.chunked {
                self.state.content_length = None;
            }
            return Ok(true);
        }

        let Some((name, value)) = line.split_once(':') else {
            tracing::trace!("Ignoring malformed header line");
            return Ok(false);
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            let length = value.parse::<usize>().map_err(|_| HttpError::InvalidHeader {
                name: "Content-Length",
                value: value.to_string(),
            })?;
            self.state.content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            self.state.chunked = value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("connection") {
            self.state.connection = if value.eq_ignore_ascii_case("keep-alive") {
                ConnectionType::KeepAlive
            } else if value.eq_ignore_ascii_case("close") {
                ConnectionType::Close
            } else {
                ConnectionType::Undefined
            };
        } else if name.eq_ignore_ascii_case("etag") {
            self.state.etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("location") {
            self.state.location = Some(value.to_string());
        }
        Ok(false)
    }
}

fn parse_status_line(line: &str) -> Result<u16, HttpError> {
    let malformed = || HttpError::MalformedStatusLine {
        line: line.chars().take(64).collect(),
    };
    let mut parts = line.split_whitespace();
    let version = parts.next().ok_or_else(malformed)?;
    if !version.starts_with("HTTP/") {
        return Err(malformed());
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
        .ok_or_else(malformed)
}
