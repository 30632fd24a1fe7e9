//! Top-level error types and the error-code lookup table.
//!
//! Each component reports its own error enum; [`Error`] gathers them for
//! callers that drive several components at once. Every error carries a
//! stable integer code: negative values are raised on the client side,
//! positive values are HTTP status codes reported by the server.
//! [`describe`] turns either kind back into a human-readable string.

use thiserror::Error;

use crate::auth::TokenError;
use crate::config::ConfigError;
use crate::http::HttpError;
use crate::payload::Base64Error;
use crate::transport::TransportError;

/// Client-side error codes.
pub mod code {
    /// The server refused the TCP connection.
    pub const CONNECTION_REFUSED: i32 = -1;
    /// Writing the request line or headers failed.
    pub const SEND_HEADER_FAILED: i32 = -2;
    /// Writing the request body failed.
    pub const SEND_PAYLOAD_FAILED: i32 = -3;
    /// An operation required an open connection.
    pub const NOT_CONNECTED: i32 = -4;
    /// The socket disconnected mid-read.
    pub const CONNECTION_LOST: i32 = -5;
    /// The peer did not answer with an HTTP status line.
    pub const NO_HTTP_SERVER: i32 = -6;
    /// A response header could not be parsed.
    pub const HEADER_PARSE: i32 = -7;
    /// The response body exceeded the configured limit.
    pub const BODY_TOO_LARGE: i32 = -8;
    /// No response bytes arrived within the response timeout.
    pub const READ_TIMEOUT: i32 = -11;
    /// The redirect chain exceeded the configured maximum.
    pub const MAX_REDIRECTS: i32 = -12;
    /// Another request currently holds the connection.
    pub const CONNECTION_IN_USE: i32 = -13;
    /// A redirect carried an unusable `Location`.
    pub const INVALID_REDIRECT: i32 = -14;
    /// Chunked transfer coding was malformed.
    pub const CHUNK_DECODE: i32 = -20;
    /// Inline base64 payload was malformed.
    pub const BASE64_DECODE: i32 = -21;
    /// A decoded-byte sink rejected a write.
    pub const SINK_WRITE: i32 = -22;
    /// The wall clock could not be synchronised in time.
    pub const TIME_SYNC_TIMEOUT: i32 = -31;
    /// The service-account private key could not be parsed.
    pub const PRIVATE_KEY_PARSE: i32 = -32;
    /// RSA signing of the JWT failed.
    pub const SIGNING_FAILED: i32 = -33;
    /// The token endpoint answered without a usable token.
    pub const INVALID_TOKEN_RESPONSE: i32 = -34;
    /// No credentials or database URL were configured.
    pub const MISSING_CREDENTIALS: i32 = -35;
    /// A token request is already in flight.
    pub const TOKEN_REQUEST_IN_PROGRESS: i32 = -36;
    /// The token is not ready for use.
    pub const TOKEN_NOT_READY: i32 = -37;
    /// The configuration was rejected.
    pub const INVALID_CONFIG: i32 = -40;
}

/// Top-level error type encompassing all embercloud errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Response framing or server-reported failure.
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    /// Inline payload decoding failure.
    #[error("payload error: {0}")]
    Payload(#[from] Base64Error),

    /// Credential lifecycle failure.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Transport(e) => e.code(),
            Self::Http(e) => e.code(),
            Self::Payload(e) => e.code(),
            Self::Token(e) => e.code(),
            Self::Config(e) => e.code(),
        }
    }
}

/// Convenience alias for results carrying [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Look up the human-readable description of an error code.
///
/// Positive codes are treated as HTTP status codes.
pub fn describe(code: i32) -> &'static str {
    match code {
        code::CONNECTION_REFUSED => "connection refused",
        code::SEND_HEADER_FAILED => "send request header failed",
        code::SEND_PAYLOAD_FAILED => "send request payload failed",
        code::NOT_CONNECTED => "not connected",
        code::CONNECTION_LOST => "connection lost",
        code::NO_HTTP_SERVER => "no HTTP server",
        code::HEADER_PARSE => "response header parse failed",
        code::BODY_TOO_LARGE => "response payload too large",
        code::READ_TIMEOUT => "response read timed out",
        code::MAX_REDIRECTS => "maximum redirection reached",
        code::CONNECTION_IN_USE => "connection in use",
        code::INVALID_REDIRECT => "invalid redirect location",
        code::CHUNK_DECODE => "malformed chunked transfer encoding",
        code::BASE64_DECODE => "malformed base64 payload",
        code::SINK_WRITE => "writing decoded data failed",
        code::TIME_SYNC_TIMEOUT => "NTP server time reading timed out",
        code::PRIVATE_KEY_PARSE => "private key parsing failed",
        code::SIGNING_FAILED => "token signing failed",
        code::INVALID_TOKEN_RESPONSE => "invalid token response",
        code::MISSING_CREDENTIALS => "missing credentials",
        code::TOKEN_REQUEST_IN_PROGRESS => "token request in progress",
        code::TOKEN_NOT_READY => "token is not ready",
        code::INVALID_CONFIG => "invalid configuration",
        c if c > 0 => u16::try_from(c).map_or("unknown error", crate::http::status_text),
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_client_codes() {
        assert_eq!(describe(code::READ_TIMEOUT), "response read timed out");
        assert_eq!(describe(code::MAX_REDIRECTS), "maximum redirection reached");
        assert_eq!(describe(-999), "unknown error");
    }

    #[test]
    fn test_describe_http_codes() {
        assert_eq!(describe(401), "unauthorized");
        assert_eq!(describe(404), "not found");
    }

    #[test]
    fn test_error_code_passthrough() {
        let err = Error::from(TransportError::ConnectionLost);
        assert_eq!(err.code(), code::CONNECTION_LOST);
        assert!(err.to_string().contains("connection lost"));
    }
}
