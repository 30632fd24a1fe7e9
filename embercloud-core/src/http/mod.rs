//! HTTP/1.1 response pipeline.
//!
//! This module provides:
//! - [`ResponseState`] - Per-request header facts and payload classification
//! - [`ResponseHeaderParser`] - Status line and known-header extraction
//! - [`ChunkedBodyDecoder`] - Incremental chunked transfer decoding
//! - [`Request`] - Request serialisation onto a [`Client`](crate::transport::Client)
//! - [`HttpSession`] - Request/response exchange with redirect handling
//!
//! This is deliberately not a general-purpose HTTP client: only the headers
//! the pipeline acts on are kept.

use serde::Deserialize;
use thiserror::Error;

use crate::error::code;
use crate::payload::{classify, Classification, DataType};
use crate::transport::TransportError;

mod chunked;
mod header;
mod request;
mod session;

pub use chunked::{ChunkDecodeState, ChunkError, ChunkPhase, ChunkedBodyDecoder, Decoded};
pub use header::ResponseHeaderParser;
pub use request::{Method, Request};
pub use session::{Endpoint, HttpResponse, HttpSession, SessionOptions};

/// Error type for response processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// Socket-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The first response line was not an HTTP status line.
    #[error("malformed status line: {line}")]
    MalformedStatusLine { line: String },

    /// A header value could not be parsed.
    #[error("invalid {name} header: {value}")]
    InvalidHeader { name: &'static str, value: String },

    /// The chunked body was malformed.
    #[error("chunked decoding failed: {0}")]
    Chunk(#[from] ChunkError),

    /// The body exceeded the configured limit.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// The server reported an error.
    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },
}

impl HttpError {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Transport(e) => e.code(),
            Self::MalformedStatusLine { .. } => code::NO_HTTP_SERVER,
            Self::InvalidHeader { .. } => code::HEADER_PARSE,
            Self::Chunk(_) => code::CHUNK_DECODE,
            Self::BodyTooLarge { .. } => code::BODY_TOO_LARGE,
            Self::Server { status, .. } => i32::from(*status),
        }
    }
}

/// Value of the `Connection` response header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionType {
    /// `Connection: keep-alive`.
    KeepAlive,
    /// `Connection: close`.
    Close,
    /// Header absent or unrecognised.
    #[default]
    Undefined,
}

/// Facts gathered about one in-flight response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseState {
    /// HTTP status code from the status line.
    pub http_code: u16,
    /// Body length; `None` when chunked or unknown.
    pub content_length: Option<usize>,
    /// Whether `Transfer-Encoding: chunked` was announced.
    pub chunked: bool,
    /// Connection persistence requested by the server.
    pub connection: ConnectionType,
    /// The status line has been parsed.
    pub header_parsed: bool,
    /// The blank line ending the header block has been seen.
    pub header_complete: bool,
    /// Version identifier for optimistic-concurrency writes.
    pub etag: Option<String>,
    /// Redirect target.
    pub location: Option<String>,
    /// Server-generated key returned by a push.
    pub push_name: Option<String>,
    /// Error text reported by the server.
    pub server_error_message: Option<String>,
    payload: Option<Classification>,
}

impl ResponseState {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_code)
    }

    /// Whether the status asks the client to re-issue the request elsewhere.
    pub fn is_redirect(&self) -> bool {
        matches!(self.http_code, 301 | 302 | 307 | 308)
    }

    /// Whether the connection should be closed after this response.
    pub fn closes_connection(&self) -> bool {
        self.connection == ConnectionType::Close
    }

    /// The payload classification, if decided.
    pub fn payload(&self) -> Option<&Classification> {
        self.payload.as_ref()
    }

    /// Classify the payload text starting at `offset`.
    ///
    /// The decision is made at most once per response; later calls return
    /// the first classification unchanged.
    pub fn classify_payload(&mut self, text: &str, offset: usize) -> Classification {
        *self.payload.get_or_insert_with(|| classify(text, offset))
    }

    /// Force the payload type (shallow reads, server timestamps) unless one
    /// was already decided.
    pub fn force_payload_type(&mut self, data_type: DataType, text: &str) -> Classification {
        *self
            .payload
            .get_or_insert_with(|| Classification::whole(data_type, text.len()))
    }

    /// Capture push names and error messages carried by a complete body.
    pub fn inspect_body(&mut self, body: &[u8]) {
        if let Some(message) = extract_server_error(body) {
            self.server_error_message = Some(message);
        } else if !self.is_success() && self.server_error_message.is_none() {
            self.server_error_message = Some(status_text(self.http_code).to_string());
        }
        if self.is_success() {
            if let Some(name) = extract_push_name(body) {
                self.push_name = Some(name);
            }
        }
    }
}

/// Human-readable text for an HTTP status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "created",
        204 => "no content",
        301 => "moved permanently",
        302 => "found",
        304 => "not modified",
        307 => "temporary redirect",
        308 => "permanent redirect",
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        405 => "method not allowed",
        406 => "not acceptable",
        407 => "proxy authentication required",
        408 => "request time out",
        411 => "length required",
        412 => "precondition failed",
        413 => "payload too large",
        414 => "URI too long",
        415 => "unsupported media type",
        423 => "locked",
        429 => "too many requests",
        500 => "internal server error",
        502 => "bad gateway",
        503 => "service unavailable",
        504 => "gateway timeout",
        505 => "HTTP version not supported",
        507 => "insufficient storage",
        511 => "network authentication required",
        _ => "unknown HTTP status",
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorField {
    Text(String),
    Detailed { message: String },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorField,
}

/// Extract the server message from `{"error": "..."}` or
/// `{"error": {"message": "..."}}`.
pub fn extract_server_error(body: &[u8]) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    Some(match parsed.error {
        ErrorField::Text(text) => text,
        ErrorField::Detailed { message } => message,
    })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PushBody {
    name: String,
}

/// Extract the generated key from a `{"name": "-Nxyz"}` push reply.
pub fn extract_push_name(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<PushBody>(body).ok().map(|p| p.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_statuses() {
        for code in [301, 302, 307, 308] {
            let state = ResponseState {
                http_code: code,
                ..Default::default()
            };
            assert!(state.is_redirect());
        }
        let ok = ResponseState {
            http_code: 200,
            ..Default::default()
        };
        assert!(!ok.is_redirect());
        assert!(ok.is_success());
    }

    #[test]
    fn test_extract_server_error_variants() {
        assert_eq!(
            extract_server_error(br#"{"error":"Permission denied"}"#).as_deref(),
            Some("Permission denied")
        );
        assert_eq!(
            extract_server_error(br#"{"error":{"code":400,"message":"INVALID_PASSWORD"}}"#)
                .as_deref(),
            Some("INVALID_PASSWORD")
        );
        assert_eq!(extract_server_error(br#"{"value":1}"#), None);
    }

    #[test]
    fn test_inspect_body_push_name() {
        let mut state = ResponseState {
            http_code: 200,
            ..Default::default()
        };
        state.inspect_body(br#"{"name":"-NabcDEF"}"#);
        assert_eq!(state.push_name.as_deref(), Some("-NabcDEF"));
        assert_eq!(state.server_error_message, None);
    }

    #[test]
    fn test_inspect_body_error_on_ok_status() {
        let mut state = ResponseState {
            http_code: 200,
            ..Default::default()
        };
        state.inspect_body(br#"{"error":"Index not defined"}"#);
        assert_eq!(
            state.server_error_message.as_deref(),
            Some("Index not defined")
        );
    }

    #[test]
    fn test_inspect_body_falls_back_to_status_text() {
        let mut state = ResponseState {
            http_code: 503,
            ..Default::default()
        };
        state.inspect_body(b"<html>busy</html>");
        assert_eq!(
            state.server_error_message.as_deref(),
            Some("service unavailable")
        );
    }

    #[test]
    fn test_classification_decided_once() {
        let mut state = ResponseState::default();
        let first = state.classify_payload("42", 0);
        assert_eq!(first.data_type, DataType::Integer);
        let second = state.classify_payload("\"text\"", 0);
        assert_eq!(second.data_type, DataType::Integer);
    }
}
