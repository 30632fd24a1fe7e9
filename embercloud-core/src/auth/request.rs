//! Token endpoint exchanges.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{IssuedToken, Secret, TokenError};
use crate::clock::Clock;
use crate::http::{HttpError, HttpResponse, HttpSession, Request, SessionOptions};
use crate::transport::{Client, ConnectionLock};

/// Email/password, anonymous and custom-token sign-in.
pub const IDENTITY_HOST: &str = "identitytoolkit.googleapis.com";
/// ID token refresh.
pub const SECURE_TOKEN_HOST: &str = "securetoken.googleapis.com";
/// OAuth2 grants.
pub const OAUTH2_HOST: &str = "oauth2.googleapis.com";

/// Inactivity after which a token response body is considered complete.
pub const DEFAULT_IDLE_CUTOFF: Duration = Duration::from_secs(5);

/// Lifetime assumed when the endpoint does not announce one.
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Number(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize)]
struct TokenReply {
    #[serde(default, alias = "idToken")]
    id_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default, alias = "expiresIn")]
    expires_in: Option<ExpiresIn>,
}

/// Parse a token endpoint response.
pub fn parse_token_response(response: &HttpResponse) -> Result<IssuedToken, TokenError> {
    let server_error = response
        .state
        .server_error_message
        .clone()
        .or_else(|| crate::http::extract_server_error(&response.body));
    if !response.state.is_success() || server_error.is_some() {
        let status = response.status();
        let message =
            server_error.unwrap_or_else(|| crate::http::status_text(status).to_string());
        return Err(TokenError::Exchange { status, message });
    }
    let reply: TokenReply = response.json().map_err(|e| TokenError::InvalidResponse {
        message: e.to_string(),
    })?;
    let token = reply
        .id_token
        .or(reply.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TokenError::InvalidResponse {
            message: "no token in response".to_string(),
        })?;
    let expires_in = match reply.expires_in {
        Some(expires) => expires.seconds().ok_or_else(|| TokenError::InvalidResponse {
            message: "unparsable expiry".to_string(),
        })?,
        None => DEFAULT_EXPIRES_IN,
    };
    Ok(IssuedToken {
        token: Secret::new(token),
        refresh_token: reply.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
        expires_in,
    })
}

/// JSON POSTs against the fixed token hosts over one guarded connection.
///
/// Only one exchange runs at a time; a concurrent call fails with
/// [`TokenError::RequestInProgress`] instead of waiting. The response body
/// ends at the announced length, the final chunk, or after the idle cutoff,
/// whichever comes first.
#[derive(Clone)]
pub struct TokenRequestTransport {
    session: ConnectionLock<HttpSession<Box<dyn Client>>>,
}

impl TokenRequestTransport {
    /// Create a transport over `client`.
    ///
    /// An idle cutoff of [`DEFAULT_IDLE_CUTOFF`] is applied unless
    /// `options` sets one.
    pub fn new(client: Box<dyn Client>, clock: Arc<dyn Clock>, options: SessionOptions) -> Self {
        let options = match options.idle_cutoff {
            Some(_) => options,
            None => options.with_idle_cutoff(DEFAULT_IDLE_CUTOFF),
        };
        Self {
            session: ConnectionLock::new(HttpSession::new(client, clock).with_options(options)),
        }
    }

    /// Whether an exchange is in flight.
    pub fn is_busy(&self) -> bool {
        self.session.is_reserved()
    }

    /// Close the pooled connection if no exchange is using it.
    pub fn close(&self) {
        if let Ok(mut session) = self.session.try_reserve() {
            session.close();
        }
    }

    /// POST `body` to `host` and read the whole response.
    pub fn post_json(&self, host: &str, path: &str, body: &Value) -> Result<HttpResponse, TokenError> {
        let mut session = self
            .session
            .try_reserve()
            .map_err(|_| TokenError::RequestInProgress)?;
        // The path may carry the API key, so only the host is logged.
        tracing::debug!("Token request to {}", host);
        let request = Request::post(host, path).with_json(body);
        let response = session.send(&request).map_err(|e| match e {
            HttpError::Server { status, message } => TokenError::Exchange { status, message },
            other => TokenError::Http(other),
        })?;
        tracing::debug!("Token endpoint {} answered {}", host, response.status());
        Ok(response)
    }

    /// POST and parse the token reply.
    pub fn request_token(&self, host: &str, path: &str, body: &Value) -> Result<IssuedToken, TokenError> {
        let response = self.post_json(host, path, body)?;
        parse_token_response(&response)
    }

    /// Email/password sign-in.
    pub fn sign_in_with_password(
        &self,
        api_key: &Secret,
        email: &str,
        password: &Secret,
    ) -> Result<IssuedToken, TokenError> {
        self.request_token(
            IDENTITY_HOST,
            &format!("/v1/accounts:signInWithPassword?key={}", api_key.expose()),
            &json!({
                "email": email,
                "password": password.expose(),
                "returnSecureToken": true,
            }),
        )
    }

    /// Anonymous sign-up.
    pub fn sign_up_anonymous(&self, api_key: &Secret) -> Result<IssuedToken, TokenError> {
        self.request_token(
            IDENTITY_HOST,
            &format!("/v1/accounts:signUp?key={}", api_key.expose()),
            &json!({ "returnSecureToken": true }),
        )
    }

    /// Exchange a custom token for an ID token.
    pub fn sign_in_with_custom_token(&self, api_key: &Secret, token: &str) -> Result<IssuedToken, TokenError> {
        self.request_token(
            IDENTITY_HOST,
            &format!("/v1/accounts:signInWithCustomToken?key={}", api_key.expose()),
            &json!({ "token": token, "returnSecureToken": true }),
        )
    }

    /// Refresh an ID token.
    pub fn refresh_id_token(&self, api_key: &Secret, refresh_token: &Secret) -> Result<IssuedToken, TokenError> {
        self.request_token(
            SECURE_TOKEN_HOST,
            &format!("/v1/token?key={}", api_key.expose()),
            &json!({
                "grantType": "refresh_token",
                "refreshToken": refresh_token.expose(),
            }),
        )
    }

    /// Exchange a signed service-account assertion for an access token.
    pub fn exchange_jwt_bearer(&self, assertion: &str) -> Result<IssuedToken, TokenError> {
        self.request_token(
            OAUTH2_HOST,
            "/token",
            &json!({
                "grant_type": "urn:ietf:params:oauth:grant-type:jwt-bearer",
                "assertion": assertion,
            }),
        )
    }

    /// Exchange a user refresh token for an access token.
    pub fn refresh_access_token(
        &self,
        client_id: &str,
        client_secret: &Secret,
        refresh_token: &Secret,
    ) -> Result<IssuedToken, TokenError> {
        self.request_token(
            OAUTH2_HOST,
            "/token",
            &json!({
                "client_id": client_id,
                "client_secret": client_secret.expose(),
                "grant_type": "refresh_token",
                "refresh_token": refresh_token.expose(),
            }),
        )
    }
}

impl std::fmt::Debug for TokenRequestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRequestTransport")
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{Exchange, MemoryClient, TransportError};

    fn transport(handle: &MemoryClient) -> TokenRequestTransport {
        TokenRequestTransport::new(
            Box::new(handle.clone()),
            Arc::new(ManualClock::new(0).with_idle_step(Duration::from_millis(100))),
            SessionOptions::default(),
        )
    }

    fn json_response(status: &str, body: &str) -> Exchange {
        Exchange::response(format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    #[test]
    fn test_sign_in_with_password() {
        let handle = MemoryClient::new().with(json_response(
            "200 OK",
            r#"{"idToken":"id-1","refreshToken":"rt-1","expiresIn":"3600","localId":"u1"}"#,
        ));
        let issued = transport(&handle)
            .sign_in_with_password(&Secret::new("KEY"), "a@example.com", &Secret::new("pw"))
            .unwrap();
        assert_eq!(issued.token.expose(), "id-1");
        assert_eq!(issued.refresh_token.unwrap().expose(), "rt-1");
        assert_eq!(issued.expires_in, 3600);

        let written = handle.written_string();
        assert!(written.starts_with("POST /v1/accounts:signInWithPassword?key=KEY HTTP/1.1\r\n"));
        assert!(written.contains("Content-Type: application/json\r\n"));
        assert!(written.contains("Connection: keep-alive\r\n"));
        assert!(written.contains("\"returnSecureToken\":true"));
        assert_eq!(handle.connections(), vec![(IDENTITY_HOST.to_string(), 443)]);
    }

    #[test]
    fn test_oauth_reply_with_numeric_expiry() {
        let handle = MemoryClient::new().with(json_response(
            "200 OK",
            r#"{"access_token":"ya29.x","expires_in":3599,"token_type":"Bearer"}"#,
        ));
        let issued = transport(&handle).exchange_jwt_bearer("a.b.c").unwrap();
        assert_eq!(issued.token.expose(), "ya29.x");
        assert_eq!(issued.expires_in, 3599);
        assert!(issued.refresh_token.is_none());
        assert!(handle.written_string().contains("jwt-bearer"));
    }

    #[test]
    fn test_server_message_surfaced() {
        let handle = MemoryClient::new().with(json_response(
            "400 Bad Request",
            r#"{"error":{"code":400,"message":"INVALID_PASSWORD"}}"#,
        ));
        let err = transport(&handle)
            .sign_in_with_password(&Secret::new("KEY"), "a@example.com", &Secret::new("bad"))
            .unwrap_err();
        assert_eq!(
            err,
            TokenError::Exchange {
                status: 400,
                message: "INVALID_PASSWORD".to_string()
            }
        );
    }

    #[test]
    fn test_error_body_with_success_status() {
        let handle = MemoryClient::new().with(json_response(
            "200 OK",
            r#"{"error":{"code":400,"message":"TOKEN_EXPIRED"}}"#,
        ));
        let err = transport(&handle)
            .refresh_id_token(&Secret::new("KEY"), &Secret::new("rt-1"))
            .unwrap_err();
        assert_eq!(
            err,
            TokenError::Exchange {
                status: 200,
                message: "TOKEN_EXPIRED".to_string()
            }
        );
    }

    #[test]
    fn test_missing_token_is_invalid() {
        let handle = MemoryClient::new().with(json_response("200 OK", r#"{"kind":"x"}"#));
        let err = transport(&handle).sign_up_anonymous(&Secret::new("KEY")).unwrap_err();
        assert!(matches!(err, TokenError::InvalidResponse { .. }));
    }

    #[test]
    fn test_idle_cutoff_ends_body() {
        // No length, no chunking, and the server never closes.
        let handle = MemoryClient::new().with(
            Exchange::new()
                .segment("HTTP/1.1 200 OK\r\n\r\n")
                .segment(r#"{"idToken":"id-2","expiresIn":"60"}"#),
        );
        let issued = transport(&handle)
            .sign_in_with_custom_token(&Secret::new("KEY"), "custom")
            .unwrap();
        assert_eq!(issued.token.expose(), "id-2");
        assert_eq!(issued.expires_in, 60);
    }

    #[test]
    fn test_concurrent_request_rejected() {
        let handle = MemoryClient::new();
        let transport = transport(&handle);
        let other = transport.clone();
        let _held = transport.session.try_reserve().unwrap();
        assert!(other.is_busy());
        let err = other.sign_up_anonymous(&Secret::new("KEY")).unwrap_err();
        assert_eq!(err, TokenError::RequestInProgress);
    }

    #[test]
    fn test_refused_connection() {
        let handle = MemoryClient::new();
        handle.refuse_next(1);
        let err = transport(&handle).sign_up_anonymous(&Secret::new("KEY")).unwrap_err();
        assert!(matches!(
            err,
            TokenError::Http(HttpError::Transport(TransportError::ConnectionRefused { .. }))
        ));
    }
}
