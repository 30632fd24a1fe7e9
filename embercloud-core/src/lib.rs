//! # Embercloud Core
//!
//! Response pipeline and credential lifecycle for cloud-backend clients on
//! constrained devices.
//!
//! This crate provides:
//! - A byte-stream transport abstraction with timeout-bounded reads
//! - An HTTP/1.1 response pipeline: header parsing, chunked decoding,
//!   redirects and server error extraction
//! - Payload classification and incremental inline base64 decoding into
//!   memory, files or firmware updaters
//! - Server-sent event subscriptions with keep-alive tracking (feature
//!   `stream`)
//! - A tick-driven credential state machine for legacy secrets, ID tokens,
//!   and service-account JWTs (signing behind feature `service-account`)
//!
//! Every component does a bounded slice of work per call, so it can be
//! driven from a device main loop.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use embercloud_core::{
//!     AuthConfig, ClientConfig, CredentialStateMachine, SystemClock, TcpClient,
//!     TokenRequestTransport,
//! };
//!
//! fn token(config: &ClientConfig) -> embercloud_core::Result<()> {
//!     let clock = Arc::new(SystemClock::new());
//!     let transport = TokenRequestTransport::new(
//!         Box::new(TcpClient::new()),
//!         clock.clone(),
//!         config.token_session_options(),
//!     );
//!     let mut machine = CredentialStateMachine::new(config, transport, clock)?;
//!     let credential = machine.run_until_ready()?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod payload;
pub mod transport;

#[cfg(feature = "stream")]
pub mod stream;

// Re-export commonly used types at crate root
pub use auth::{
    Credential,
    CredentialStateMachine,
    Secret,
    TokenError,
    TokenHandle,
    TokenInfo,
    TokenObserver,
    TokenRequestTransport,
    TokenStatus,
    TokenType,
};

pub use clock::{
    Clock,
    ManualClock,
    SystemClock,
    TimeSync,
};

pub use config::{
    AuthConfig,
    ClientConfig,
    ConfigError,
    ServiceAccount,
    TimeoutConfig,
};

pub use error::{describe, Error, Result};

pub use http::{
    ChunkedBodyDecoder,
    HttpError,
    HttpSession,
    Request,
    ResponseHeaderParser,
    ResponseState,
};

pub use payload::{
    classify,
    decode_base64_stream,
    ByteSink,
    DataType,
    DownloadTarget,
    OpenSink,
    TypedValue,
};

pub use transport::{
    ByteStreamReader,
    Client,
    ConnectionLock,
    MemoryClient,
    TcpClient,
    TransportError,
};

#[cfg(feature = "stream")]
pub use stream::{
    EventStreamFramer,
    StreamConnection,
    StreamEvent,
    StreamSignal,
    StreamWorker,
};
