//! The credential lifecycle, driven one step per tick.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{
    Credential, IssuedToken, JwtAudience, JwtBuilder, JwtStep, RateLimitedNotifier, Secret,
    TokenError, TokenErrorInfo, TokenHandle, TokenObserver, TokenRequestTransport, TokenState,
    TokenStatus, TokenType,
};
use crate::clock::{Clock, SystemTimeSync, TimeSync};
use crate::config::{AuthConfig, ClientConfig, ConfigError, TimeoutConfig};

/// Acquires, renews and recovers the client's token.
///
/// Each [`tick`](Self::tick) performs at most one step: a time-sync check,
/// one JWT build step, or one endpoint exchange. Call it from the main
/// loop, or use [`run_until_ready`](Self::run_until_ready) to drive it to
/// completion.
///
/// ```text
/// uninitialized -> on_initialize -> [on_signing] -> on_request -> ready
///                        ^                                          |
///                        +---- error <--- (any failure)     on_refresh
/// ```
pub struct CredentialStateMachine {
    auth: AuthConfig,
    api_key: Option<Secret>,
    pre_refresh_seconds: i64,
    timeouts: TimeoutConfig,
    state: Arc<RwLock<TokenState>>,
    clock: Arc<dyn Clock>,
    time_sync: Box<dyn TimeSync>,
    transport: TokenRequestTransport,
    notifier: Option<RateLimitedNotifier>,
    jwt: Option<JwtBuilder>,
    sync_started: Option<u64>,
    last_sync_request: Option<u64>,
    error_at: u64,
    last_error: Option<TokenError>,
}

impl CredentialStateMachine {
    /// Create a machine for `config`.
    pub fn new(
        config: &ClientConfig,
        transport: TokenRequestTransport,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = config.clone().normalized();
        Ok(Self {
            state: Arc::new(RwLock::new(TokenState::new(config.auth.token_type()))),
            auth: config.auth,
            api_key: config.api_key,
            pre_refresh_seconds: config.pre_refresh_seconds,
            timeouts: config.timeouts,
            clock,
            time_sync: Box::new(SystemTimeSync),
            transport,
            notifier: None,
            jwt: None,
            sync_started: None,
            last_sync_request: None,
            error_at: 0,
            last_error: None,
        })
    }

    /// Use `sync` to set the wall clock when it is not yet valid.
    pub fn with_time_sync(mut self, sync: impl TimeSync + 'static) -> Self {
        self.time_sync = Box::new(sync);
        self
    }

    /// Report status changes to `observer`, errors at most once per
    /// token error interval.
    pub fn with_observer(mut self, observer: impl TokenObserver + 'static) -> Self {
        self.notifier = Some(RateLimitedNotifier::new(
            Box::new(observer),
            self.timeouts.token_error_interval(),
        ));
        self
    }

    /// A read-only view of the token for other components.
    pub fn handle(&self) -> TokenHandle {
        TokenHandle::new(Arc::clone(&self.state))
    }

    /// Current status.
    pub fn status(&self) -> TokenStatus {
        self.state.read().status
    }

    /// Token type of the configured auth mode.
    pub fn token_type(&self) -> TokenType {
        self.state.read().token_type
    }

    /// Progress of the JWT build, while one is underway.
    pub fn jwt_step(&self) -> Option<JwtStep> {
        self.jwt.as_ref().map(JwtBuilder::step)
    }

    /// The most recent failure.
    pub fn last_error(&self) -> Option<&TokenError> {
        self.last_error.as_ref()
    }

    /// Forget the token and start over on the next tick.
    pub fn invalidate(&mut self) {
        tracing::info!("Invalidating {}", self.token_type());
        {
            let mut state = self.state.write();
            state.clear();
            state.refresh_token = None;
        }
        self.jwt = None;
        self.set_status(TokenStatus::OnInitialize);
    }

    /// Switch to a different auth mode.
    pub fn set_auth(&mut self, auth: AuthConfig) -> Result<(), ConfigError> {
        let mut candidate = ClientConfig::new(auth.clone());
        candidate.api_key = self.api_key.clone();
        candidate.validate()?;
        self.auth = auth;
        *self.state.write() = TokenState::new(self.auth.token_type());
        self.jwt = None;
        self.last_error = None;
        self.set_status(TokenStatus::OnInitialize);
        Ok(())
    }

    /// Advance by one step and return the resulting status.
    pub fn tick(&mut self) -> TokenStatus {
        let status = self.status();
        let result = match status {
            TokenStatus::Uninitialized => {
                self.set_status(TokenStatus::OnInitialize);
                Ok(())
            }
            TokenStatus::OnInitialize => self.initialize(),
            TokenStatus::OnSigning => self.sign_step(),
            TokenStatus::OnRequest => self.request(),
            TokenStatus::OnRefresh => self.refresh(),
            TokenStatus::Ready => {
                self.check_expiry();
                Ok(())
            }
            TokenStatus::Error => {
                self.retry_after_error();
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail(e);
        }
        self.status()
    }

    /// Tick until a token is ready or an attempt fails.
    ///
    /// Idles the clock between ticks that make no progress. Starting from
    /// [`TokenStatus::Error`], waits out the error interval first.
    pub fn run_until_ready(&mut self) -> Result<Credential, TokenError> {
        loop {
            let before = self.status();
            let after = self.tick();
            match after {
                TokenStatus::Ready => return self.handle().credential(),
                TokenStatus::Error if before != TokenStatus::Error => {
                    return Err(self.last_error.clone().unwrap_or(TokenError::NotReady));
                }
                _ if after == before => self.clock.idle(),
                _ => {}
            }
        }
    }

    fn set_status(&mut self, status: TokenStatus) {
        let info = {
            let mut state = self.state.write();
            if state.status == status {
                return;
            }
            tracing::debug!("Token status {} -> {}", state.status, status);
            state.status = status;
            if status != TokenStatus::Error {
                state.error = None;
            }
            state.info()
        };
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.notify(&info, self.clock.now_millis());
        }
    }

    fn fail(&mut self, error: TokenError) {
        tracing::warn!("{} failed: {}", self.token_type(), error);
        self.state.write().error = Some(TokenErrorInfo::from(&error));
        self.jwt = None;
        self.sync_started = None;
        self.last_sync_request = None;
        self.error_at = self.clock.now_millis();
        self.last_error = Some(error);
        self.set_status(TokenStatus::Error);
    }

    fn retry_after_error(&mut self) {
        let waited = self.clock.now_millis().saturating_sub(self.error_at);
        if waited >= self.timeouts.token_error_interval_ms {
            tracing::debug!("Retrying token generation");
            self.set_status(TokenStatus::OnInitialize);
        }
    }

    /// Whether the wall clock is usable, requesting a sync if not.
    fn time_ready(&mut self) -> Result<bool, TokenError> {
        if self.clock.is_time_valid() {
            self.sync_started = None;
            self.last_sync_request = None;
            return Ok(true);
        }
        let now = self.clock.now_millis();
        let started = *self.sync_started.get_or_insert(now);
        if now.saturating_sub(started) >= self.timeouts.ntp_timeout_ms {
            return Err(TokenError::TimeSyncTimeout);
        }
        let due = self
            .last_sync_request
            .is_none_or(|last| now.saturating_sub(last) >= self.timeouts.time_sync_retry_ms);
        if due {
            tracing::debug!("Wall clock not set, requesting time sync");
            self.time_sync.request_sync();
            self.last_sync_request = Some(now);
        }
        Ok(false)
    }

    fn initialize(&mut self) -> Result<(), TokenError> {
        if let AuthConfig::Legacy { secret } = &self.auth {
            {
                let mut state = self.state.write();
                state.token = Some(secret.clone());
                state.expires_at_epoch = 0;
                state.error = None;
            }
            self.set_status(TokenStatus::Ready);
            return Ok(());
        }
        if !self.time_ready()? {
            return Ok(());
        }
        let audience = match &self.auth {
            AuthConfig::ServiceAccountCustomToken { uid, claims, .. } => Some(JwtAudience::CustomToken {
                uid: uid.clone(),
                claims: claims.clone(),
            }),
            AuthConfig::ServiceAccountAccessToken { scopes, .. } => Some(JwtAudience::AccessToken {
                scopes: scopes.clone(),
            }),
            _ => None,
        };
        match (audience, &self.auth) {
            (
                Some(audience),
                AuthConfig::ServiceAccountCustomToken { account, .. }
                | AuthConfig::ServiceAccountAccessToken { account, .. },
            ) => {
                let account = account.load().map_err(|e| TokenError::PrivateKey {
                    message: e.to_string(),
                })?;
                self.jwt = Some(JwtBuilder::new(account, audience));
                self.set_status(TokenStatus::OnSigning);
            }
            _ => self.set_status(TokenStatus::OnRequest),
        }
        Ok(())
    }

    fn sign_step(&mut self) -> Result<(), TokenError> {
        let now = self.clock.now_epoch();
        let Some(jwt) = self.jwt.as_mut() else {
            self.set_status(TokenStatus::OnInitialize);
            return Ok(());
        };
        match jwt.step() {
            JwtStep::Begin => {
                jwt.encode_header_payload(now)?;
            }
            JwtStep::EncodeHeaderPayload => {
                jwt.sign()?;
                self.set_status(TokenStatus::OnRequest);
            }
            JwtStep::Sign => self.set_status(TokenStatus::OnRequest),
            JwtStep::Exchange => {
                jwt.reset();
            }
        }
        Ok(())
    }

    fn request(&mut self) -> Result<(), TokenError> {
        let transport = &self.transport;
        let api_key = self.api_key.as_ref();
        let key = || api_key.ok_or(TokenError::MissingCredentials);
        let issued: Option<IssuedToken> = match &self.auth {
            AuthConfig::Legacy { .. } => None,
            AuthConfig::EmailPassword { email, password } => {
                Some(transport.sign_in_with_password(key()?, email, password)?)
            }
            AuthConfig::Anonymous => Some(transport.sign_up_anonymous(key()?)?),
            AuthConfig::CustomToken { token } => {
                Some(transport.sign_in_with_custom_token(key()?, token.expose())?)
            }
            AuthConfig::ServiceAccountCustomToken { .. } => {
                let api_key = key()?;
                match self.jwt.as_mut() {
                    Some(jwt) => jwt.exchange(|assertion| {
                        transport.sign_in_with_custom_token(api_key, assertion)
                    })?,
                    None => None,
                }
            }
            AuthConfig::ServiceAccountAccessToken { .. } => match self.jwt.as_mut() {
                Some(jwt) => jwt.exchange(|assertion| transport.exchange_jwt_bearer(assertion))?,
                None => None,
            },
            AuthConfig::RefreshToken {
                refresh_token,
                client_id,
                client_secret,
            } => Some(transport.refresh_access_token(client_id, client_secret, refresh_token)?),
        };
        self.jwt = None;
        match issued {
            Some(issued) => self.store(issued),
            None => self.set_status(TokenStatus::OnInitialize),
        }
        Ok(())
    }

    fn refresh(&mut self) -> Result<(), TokenError> {
        let Some(refresh_token) = self.state.read().refresh_token.clone() else {
            self.set_status(TokenStatus::OnInitialize);
            return Ok(());
        };
        tracing::debug!("Refreshing {}", self.token_type());
        let issued = match &self.auth {
            AuthConfig::RefreshToken {
                client_id,
                client_secret,
                ..
            } => self
                .transport
                .refresh_access_token(client_id, client_secret, &refresh_token)?,
            _ => {
                let api_key = self.api_key.as_ref().ok_or(TokenError::MissingCredentials)?;
                self.transport.refresh_id_token(api_key, &refresh_token)?
            }
        };
        self.store(issued);
        Ok(())
    }

    fn store(&mut self, issued: IssuedToken) {
        let (now_epoch, now_millis) = (self.clock.now_epoch(), self.clock.now_millis());
        let expires_in = issued.expires_in;
        self.state.write().store(issued, now_epoch, now_millis);
        self.last_error = None;
        tracing::info!("{} ready, expires in {}s", self.token_type(), expires_in);
        self.set_status(TokenStatus::Ready);
    }

    fn check_expiry(&mut self) {
        let (now_epoch, now_millis) = (self.clock.now_epoch(), self.clock.now_millis());
        let next = {
            let mut state = self.state.write();
            state.correct_drift(now_epoch, now_millis);
            if !state.is_expired(now_epoch, self.pre_refresh_seconds) {
                return;
            }
            let refreshable = state.refresh_token.is_some()
                && matches!(
                    state.token_type,
                    TokenType::IdToken | TokenType::CustomToken | TokenType::RefreshToken
                );
            if refreshable {
                TokenStatus::OnRefresh
            } else {
                state.clear();
                TokenStatus::OnInitialize
            }
        };
        tracing::info!("{} is about to expire", self.token_type());
        self.set_status(next);
    }
}

impl std::fmt::Debug for CredentialStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStateMachine")
            .field("token_type", &self.token_type())
            .field("status", &self.status())
            .field("jwt_step", &self.jwt_step())
            .finish()
    }
}
