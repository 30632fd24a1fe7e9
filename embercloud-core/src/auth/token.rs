//! Token state and the credential handed to requests.
//!
//! This module provides:
//! - [`TokenType`] / [`TokenStatus`] - What kind of token, and where it is
//!   in its lifecycle
//! - [`TokenState`] - The issued token plus its expiry bookkeeping
//! - [`TokenError`] - Failures while acquiring a token
//! - [`TokenHandle`] - A read-only, shareable view of the token state
//! - [`Credential`] - The token in the shape a request needs

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Secret;
use crate::error::code;
use crate::http::{HttpError, Request};

/// Default lead time before expiry at which a token is renewed.
pub const DEFAULT_PRE_REFRESH_SECONDS: i64 = 300;

/// Slack tolerated between monotonic and wall-clock elapsed time.
const DRIFT_TOLERANCE_SECONDS: i64 = 2;

/// Error type for credential operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The wall clock never became valid.
    #[error("time synchronisation timed out")]
    TimeSyncTimeout,

    /// The service-account private key could not be loaded.
    #[error("private key parsing failed: {message}")]
    PrivateKey { message: String },

    /// RSA signing failed.
    #[error("token signing failed")]
    SigningFailed,

    /// The token endpoint answered 2xx without a usable token.
    #[error("invalid token response: {message}")]
    InvalidResponse { message: String },

    /// The token endpoint rejected the request.
    #[error("token exchange failed ({status}): {message}")]
    Exchange { status: u16, message: String },

    /// Nothing to authenticate with.
    #[error("missing credentials")]
    MissingCredentials,

    /// Another token request holds the connection.
    #[error("token request in progress")]
    RequestInProgress,

    /// The token is not ready for use.
    #[error("token is not ready")]
    NotReady,

    /// Transport or framing failure during the exchange.
    #[error(transparent)]
    Http(#[from] HttpError),
}

impl TokenError {
    /// Stable integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::TimeSyncTimeout => code::TIME_SYNC_TIMEOUT,
            Self::PrivateKey { .. } => code::PRIVATE_KEY_PARSE,
            Self::SigningFailed => code::SIGNING_FAILED,
            Self::InvalidResponse { .. } => code::INVALID_TOKEN_RESPONSE,
            Self::Exchange { status, .. } => i32::from(*status),
            Self::MissingCredentials => code::MISSING_CREDENTIALS,
            Self::RequestInProgress => code::TOKEN_REQUEST_IN_PROGRESS,
            Self::NotReady => code::TOKEN_NOT_READY,
            Self::Http(e) => e.code(),
        }
    }
}

/// Kind of token the client holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Database secret, used as-is.
    #[default]
    Legacy,
    /// ID token from email/password, anonymous or custom-token sign-in.
    IdToken,
    /// ID token obtained by signing a custom token with a service account.
    CustomToken,
    /// OAuth2 access token from the JWT-bearer grant.
    OAuth2AccessToken,
    /// OAuth2 access token obtained from a user refresh token.
    RefreshToken,
}

impl TokenType {
    /// Whether the token goes in an `Authorization: Bearer` header rather
    /// than the `auth=` query parameter.
    pub fn is_bearer(&self) -> bool {
        matches!(self, Self::OAuth2AccessToken | Self::RefreshToken)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy token",
            Self::IdToken => "id token",
            Self::CustomToken => "custom token",
            Self::OAuth2AccessToken => "OAuth2.0 access token",
            Self::RefreshToken => "refresh token",
        }
    }
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of the token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Uninitialized,
    OnInitialize,
    OnSigning,
    OnRequest,
    OnRefresh,
    Ready,
    Error,
}

impl TokenStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::OnInitialize => "on initializing",
            Self::OnSigning => "on signing",
            Self::OnRequest => "on request",
            Self::OnRefresh => "on refreshing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error fields reported alongside a status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenErrorInfo {
    pub code: i32,
    pub message: String,
}

impl From<&TokenError> for TokenErrorInfo {
    fn from(error: &TokenError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

/// What observers are told on each status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_type: TokenType,
    pub status: TokenStatus,
    pub error: Option<TokenErrorInfo>,
}

/// A token as returned by an exchange endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: Secret,
    pub refresh_token: Option<Secret>,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

/// The token and its expiry bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub token_type: TokenType,
    pub status: TokenStatus,
    /// Wall-clock second at which the token stops being valid; 0 if unknown.
    pub expires_at_epoch: i64,
    /// Wall-clock second at issue.
    pub issued_at_epoch: i64,
    /// Monotonic millisecond at issue.
    pub issued_at_millis: u64,
    /// Lifetime announced by the server.
    pub expires_in: i64,
    pub error: Option<TokenErrorInfo>,
    pub token: Option<Secret>,
    pub refresh_token: Option<Secret>,
}

impl TokenState {
    /// An empty state for the given token type.
    pub fn new(token_type: TokenType) -> Self {
        Self {
            token_type,
            ..Self::default()
        }
    }

    /// Record a freshly issued token.
    pub fn store(&mut self, issued: IssuedToken, now_epoch: i64, now_millis: u64) {
        self.token = Some(issued.token);
        if issued.refresh_token.is_some() {
            self.refresh_token = issued.refresh_token;
        }
        self.expires_in = issued.expires_in;
        self.issued_at_epoch = now_epoch;
        self.issued_at_millis = now_millis;
        self.expires_at_epoch = now_epoch + issued.expires_in;
        self.error = None;
    }

    /// Drop the token, keeping any refresh token.
    pub fn clear(&mut self) {
        self.token = None;
        self.expires_at_epoch = 0;
        self.expires_in = 0;
    }

    /// Whether the token must be renewed.
    ///
    /// Legacy tokens never expire. Anything else is expired when no expiry
    /// is known or when less than `pre_refresh_seconds` remain.
    pub fn is_expired(&self, now_epoch: i64, pre_refresh_seconds: i64) -> bool {
        if self.token_type == TokenType::Legacy {
            return false;
        }
        self.expires_at_epoch == 0 || now_epoch > self.expires_at_epoch - pre_refresh_seconds
    }

    /// Recompute the expiry if the wall clock jumped since issue.
    ///
    /// The monotonic counter is trusted over the wall clock: the expiry
    /// becomes "now plus whatever lifetime is left on the monotonic
    /// timeline". Returns whether a correction was applied.
    pub fn correct_drift(&mut self, now_epoch: i64, now_millis: u64) -> bool {
        if self.expires_at_epoch == 0 || self.token_type == TokenType::Legacy {
            return false;
        }
        let mono_elapsed = (now_millis.saturating_sub(self.issued_at_millis) / 1000) as i64;
        let wall_elapsed = now_epoch - self.issued_at_epoch;
        let drift = wall_elapsed - mono_elapsed;
        if drift.abs() <= DRIFT_TOLERANCE_SECONDS {
            return false;
        }
        tracing::info!("Wall clock moved {}s since token issue, correcting expiry", drift);
        self.issued_at_epoch += drift;
        self.expires_at_epoch = self.issued_at_epoch + self.expires_in;
        true
    }

    /// Snapshot for observers.
    pub fn info(&self) -> TokenInfo {
        TokenInfo {
            token_type: self.token_type,
            status: self.status,
            error: self.error.clone(),
        }
    }

    /// The token in request form, if one is held.
    pub fn credential(&self) -> Option<Credential> {
        let token = self.token.clone()?;
        Some(if self.token_type.is_bearer() {
            Credential::Bearer(token)
        } else {
            Credential::AuthQuery(token)
        })
    }
}

/// How a token is attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `Authorization: Bearer <token>`.
    Bearer(Secret),
    /// `?auth=<token>` query parameter.
    AuthQuery(Secret),
}

impl Credential {
    /// Header value for bearer tokens.
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            Self::Bearer(token) => Some(format!("Bearer {}", token.expose())),
            Self::AuthQuery(_) => None,
        }
    }

    /// Query value for `auth=` tokens.
    pub fn query_param(&self) -> Option<&str> {
        match self {
            Self::AuthQuery(token) => Some(token.expose()),
            Self::Bearer(_) => None,
        }
    }

    /// Attach the credential to a request.
    pub fn apply(&self, mut request: Request) -> Request {
        match self {
            Self::Bearer(_) => {
                if let Some(header) = self.authorization_header() {
                    request = request.with_header("Authorization", header);
                }
                request
            }
            Self::AuthQuery(token) => {
                let separator = if request.path.contains('?') { '&' } else { '?' };
                request.path = format!("{}{}auth={}", request.path, separator, token.expose());
                request
            }
        }
    }
}

/// Read-only, cloneable view of the token state.
#[derive(Debug, Clone)]
pub struct TokenHandle {
    state: Arc<RwLock<TokenState>>,
}

impl TokenHandle {
    pub(crate) fn new(state: Arc<RwLock<TokenState>>) -> Self {
        Self { state }
    }

    /// Current status.
    pub fn status(&self) -> TokenStatus {
        self.state.read().status
    }

    /// Whether a token is ready.
    pub fn is_ready(&self) -> bool {
        let state = self.state.read();
        state.status == TokenStatus::Ready && state.token.is_some()
    }

    /// The ready credential.
    pub fn credential(&self) -> Result<Credential, TokenError> {
        let state = self.state.read();
        if state.status != TokenStatus::Ready {
            return Err(TokenError::NotReady);
        }
        state.credential().ok_or(TokenError::NotReady)
    }

    /// Expiry as wall-clock seconds; 0 if unknown.
    pub fn expires_at_epoch(&self) -> i64 {
        self.state.read().expires_at_epoch
    }

    /// Status snapshot.
    pub fn info(&self) -> TokenInfo {
        self.state.read().info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn issued(expires_in: i64) -> IssuedToken {
        IssuedToken {
            token: Secret::new("id-token"),
            refresh_token: Some(Secret::new("refresh")),
            expires_in,
        }
    }

    #[test]
    fn test_expiry_rule() {
        let mut state = TokenState::new(TokenType::IdToken);
        assert!(state.is_expired(NOW, DEFAULT_PRE_REFRESH_SECONDS));

        state.store(issued(3600), NOW, 0);
        assert!(!state.is_expired(NOW, DEFAULT_PRE_REFRESH_SECONDS));
        assert!(!state.is_expired(NOW + 3300, DEFAULT_PRE_REFRESH_SECONDS));
        assert!(state.is_expired(NOW + 3301, DEFAULT_PRE_REFRESH_SECONDS));
    }

    #[test]
    fn test_legacy_never_expires() {
        let state = TokenState::new(TokenType::Legacy);
        assert!(!state.is_expired(NOW, DEFAULT_PRE_REFRESH_SECONDS));
    }

    #[test]
    fn test_drift_correction_after_clock_sync() {
        let mut state = TokenState::new(TokenType::CustomToken);
        // Issued while the board still believed it was 1970 + 100s.
        state.store(issued(3600), 100, 100_000);
        assert_eq!(state.expires_at_epoch, 3700);

        // Ten seconds of real time later the clock syncs to NOW.
        assert!(state.correct_drift(NOW, 110_000));
        assert_eq!(state.expires_at_epoch, NOW - 10 + 3600);
        assert!(!state.is_expired(NOW, DEFAULT_PRE_REFRESH_SECONDS));

        // No further jump, no further correction.
        assert!(!state.correct_drift(NOW + 5, 115_000));
    }

    #[test]
    fn test_refresh_token_survives_reissue() {
        let mut state = TokenState::new(TokenType::IdToken);
        state.store(issued(3600), NOW, 0);
        state.store(
            IssuedToken {
                token: Secret::new("next"),
                refresh_token: None,
                expires_in: 3600,
            },
            NOW + 10,
            10_000,
        );
        assert_eq!(state.refresh_token, Some(Secret::new("refresh")));
    }

    #[test]
    fn test_credential_shapes() {
        let mut state = TokenState::new(TokenType::OAuth2AccessToken);
        state.store(issued(3600), NOW, 0);
        let request = state.credential().unwrap().apply(Request::get("h", "/a.json"));
        assert_eq!(request.header("Authorization"), Some("Bearer id-token"));

        state.token_type = TokenType::IdToken;
        let request = state.credential().unwrap().apply(Request::get("h", "/a.json?shallow=true"));
        assert_eq!(request.path, "/a.json?shallow=true&auth=id-token");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(TokenError::TimeSyncTimeout.code(), code::TIME_SYNC_TIMEOUT);
        let exchange = TokenError::Exchange {
            status: 400,
            message: "INVALID_PASSWORD".into(),
        };
        assert_eq!(exchange.code(), 400);
        assert_eq!(TokenErrorInfo::from(&exchange).message, "token exchange failed (400): INVALID_PASSWORD");
    }

    #[test]
    fn test_handle_not_ready() {
        let handle = TokenHandle::new(Arc::new(RwLock::new(TokenState::new(TokenType::IdToken))));
        assert_eq!(handle.credential(), Err(TokenError::NotReady));
        assert!(!handle.is_ready());
    }
}
