//! Realtime subscriptions over server-sent events.
//!
//! This module provides:
//! - [`EventStreamFramer`] - `event:`/`data:` framing with keep-alive tracking
//! - [`StreamConnection`] - A long-lived `text/event-stream` request
//! - [`ReconnectBackoff`] - Doubling reconnect delay
//! - [`StreamWorker`] - A background thread that owns a connection and
//!   reports on a channel

use serde::Serialize;

use crate::payload::{DataType, TypedValue};

mod backoff;
mod connection;
mod framer;
mod worker;

pub use backoff::ReconnectBackoff;
pub use connection::{stream_request, AuthQuery, StreamConnection};
pub use framer::{EventStreamFramer, DEFAULT_KEEP_ALIVE_TIMEOUT};
pub use worker::{StreamWorker, WorkerEvent};

/// One data notification from a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEvent {
    /// `put` or `patch`.
    pub event_type: String,
    /// Database path the change applies to.
    pub path: String,
    /// The `data` member of the envelope, verbatim.
    pub raw_data: String,
    /// Classification of `raw_data`.
    pub data_type: DataType,
}

impl StreamEvent {
    /// Whether the event replaces the value at `path`.
    pub fn is_put(&self) -> bool {
        self.event_type == "put"
    }

    /// Whether the event merges children into the value at `path`.
    pub fn is_patch(&self) -> bool {
        self.event_type == "patch"
    }

    /// Typed access to the payload.
    pub fn value(&self) -> TypedValue<'_> {
        TypedValue::new(&self.raw_data, 0)
    }
}

/// What the framer reports to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    /// A data event.
    Event(StreamEvent),
    /// The server is still there; no data.
    KeepAlive,
    /// The server cancelled the subscription, usually for lack of read
    /// permission.
    Cancelled { reason: Option<String> },
    /// The credential expired; reconnect with a fresh token.
    AuthRevoked,
    /// Nothing arrived within the keep-alive timeout.
    Timeout,
}

impl StreamSignal {
    /// Whether the subscriber should drop and reopen the connection.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::AuthRevoked | Self::Timeout)
    }
}
