//! Credential lifecycle.
//!
//! This module provides:
//! - [`Secret`] - Redacting, zeroizing wrapper for credential values
//! - [`TokenState`] / [`TokenHandle`] - The token and a shareable view of it
//! - [`JwtBuilder`] - Three-step service-account assertion builder
//! - [`TokenObserver`] / [`RateLimitedNotifier`] - Status notifications
//! - [`TokenRequestTransport`] - Guarded JSON exchanges with token hosts
//! - [`CredentialStateMachine`] - Tick-driven acquisition and renewal

mod jwt;
mod machine;
mod observer;
mod request;
mod secret;
mod token;

pub use jwt::{
    JwtAudience, JwtBuilder, JwtStep, ACCESS_TOKEN_AUDIENCE, CUSTOM_TOKEN_AUDIENCE,
    JWT_LIFETIME_SECONDS,
};
pub use machine::CredentialStateMachine;
pub use observer::{ChannelObserver, RateLimitedNotifier, TokenObserver};
pub use request::{
    parse_token_response, TokenRequestTransport, DEFAULT_IDLE_CUTOFF, IDENTITY_HOST, OAUTH2_HOST,
    SECURE_TOKEN_HOST,
};
pub use secret::Secret;
pub use token::{
    Credential, IssuedToken, TokenError, TokenErrorInfo, TokenHandle, TokenInfo, TokenState,
    TokenStatus, TokenType, DEFAULT_PRE_REFRESH_SECONDS,
};
