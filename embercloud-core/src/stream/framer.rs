//! Server-sent event framing.

use std::time::Duration;

use serde::Deserialize;
use serde_json::value::RawValue;

use super::{StreamEvent, StreamSignal};
use crate::payload::classify;

/// Silence tolerated before a stream is considered stale.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(45);

const MAX_LINE: usize = 16 * 1024;
const MAX_FRAME: usize = 1024 * 1024;

#[derive(Deserialize)]
struct Envelope<'a> {
    path: String,
    #[serde(borrow)]
    data: Option<&'a RawValue>,
}

/// Incremental parser for `event:`/`data:` frames.
///
/// Bytes may arrive split anywhere. Every completed frame, keep-alives
/// included, restarts the idle timer; [`poll_timeout`](Self::poll_timeout)
/// reports [`StreamSignal::Timeout`] once per silent period.
#[derive(Debug)]
pub struct EventStreamFramer {
    line: Vec<u8>,
    discarding: bool,
    event_type: Option<String>,
    data: String,
    keep_alive_timeout: Duration,
    last_activity: u64,
    timeout_reported: bool,
    last_path: Option<String>,
}

impl EventStreamFramer {
    /// Create a framer whose idle timer starts at `now_millis`.
    pub fn new(now_millis: u64) -> Self {
        Self {
            line: Vec::with_capacity(256),
            discarding: false,
            event_type: None,
            data: String::new(),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            last_activity: now_millis,
            timeout_reported: false,
            last_path: None,
        }
    }

    /// Set the keep-alive timeout.
    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    /// The keep-alive timeout.
    pub fn keep_alive_timeout(&self) -> Duration {
        self.keep_alive_timeout
    }

    /// Path of the most recent data event.
    pub fn last_path(&self) -> Option<&str> {
        self.last_path.as_deref()
    }

    /// Discard partial frame state for a new connection.
    ///
    /// The last-seen path survives.
    pub fn reset(&mut self, now_millis: u64) {
        self.line.clear();
        self.discarding = false;
        self.event_type = None;
        self.data.clear();
        self.last_activity = now_millis;
        self.timeout_reported = false;
    }

    /// Feed body bytes, returning the signals completed by them.
    pub fn feed(&mut self, bytes: &[u8], now_millis: u64) -> Vec<StreamSignal> {
        let mut signals = Vec::new();
        for &byte in bytes {
            if byte != b'\n' {
                if self.line.len() < MAX_LINE {
                    self.line.push(byte);
                } else if !self.discarding {
                    tracing::warn!("Event stream line exceeds {} bytes, dropping frame", MAX_LINE);
                    self.discarding = true;
                }
                continue;
            }
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);
            if let Some(signal) = self.process_line(&line, now_millis) {
                signals.push(signal);
            }
            self.line = line;
            self.line.clear();
        }
        signals
    }

    /// Report a timeout if the stream has been silent too long.
    pub fn poll_timeout(&mut self, now_millis: u64) -> Option<StreamSignal> {
        let idle = now_millis.saturating_sub(self.last_activity);
        if self.timeout_reported || idle < self.keep_alive_timeout.as_millis() as u64 {
            return None;
        }
        tracing::debug!("Event stream silent for {} ms", idle);
        self.timeout_reported = true;
        Some(StreamSignal::Timeout)
    }

    fn process_line(&mut self, line: &[u8], now_millis: u64) -> Option<StreamSignal> {
        if line.is_empty() {
            return self.dispatch(now_millis);
        }
        if self.discarding || line[0] == b':' {
            return None;
        }
        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match field {
            "event" => self.event_type = Some(value.trim().to_string()),
            "data" => {
                if self.data.len() + value.len() >= MAX_FRAME {
                    tracing::warn!("Event stream frame exceeds {} bytes, dropping frame", MAX_FRAME);
                    self.data.clear();
                    self.discarding = true;
                    return None;
                }
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(value);
            }
            _ => tracing::trace!("Ignoring event stream field {:?}", field),
        }
        None
    }

    fn dispatch(&mut self, now_millis: u64) -> Option<StreamSignal> {
        let event_type = self.event_type.take();
        let data = std::mem::take(&mut self.data);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        let event_type = event_type?;
        self.last_activity = now_millis;
        self.timeout_reported = false;

        match event_type.as_str() {
            "keep-alive" => {
                tracing::trace!("Event stream keep-alive");
                Some(StreamSignal::KeepAlive)
            }
            "cancel" => {
                let reason = match data.trim() {
                    "" | "null" => None,
                    text => Some(serde_json::from_str::<String>(text).unwrap_or_else(|_| text.to_string())),
                };
                tracing::warn!("Event stream cancelled by server: {:?}", reason);
                Some(StreamSignal::Cancelled { reason })
            }
            "auth_revoked" => {
                tracing::info!("Event stream credential revoked");
                Some(StreamSignal::AuthRevoked)
            }
            "put" | "patch" => self.data_event(event_type, &data),
            other => {
                tracing::trace!("Ignoring event type {:?}", other);
                None
            }
        }
    }

    fn data_event(&mut self, event_type: String, data: &str) -> Option<StreamSignal> {
        let envelope: Envelope<'_> = match serde_json::from_str(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Malformed {} payload: {}", event_type, e);
                return None;
            }
        };
        let raw_data = envelope.data.map_or("null", RawValue::get).to_string();
        let data_type = classify(&raw_data, 0).data_type;
        self.last_path = Some(envelope.path.clone());
        Some(StreamSignal::Event(StreamEvent {
            event_type,
            path: envelope.path,
            raw_data,
            data_type,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::DataType;

    const PUT: &[u8] = b"event: put\r\ndata: {\"path\":\"/a\",\"data\":1}\r\n\r\n";

    #[test]
    fn test_put_event() {
        let mut framer = EventStreamFramer::new(0);
        let signals = framer.feed(PUT, 10);
        assert_eq!(signals.len(), 1);
        let StreamSignal::Event(event) = &signals[0] else {
            panic!("expected data event, got {:?}", signals[0]);
        };
        assert!(event.is_put());
        assert_eq!(event.path, "/a");
        assert_eq!(event.data_type, DataType::Integer);
        assert_eq!(event.value().to_int(), Some(1));
        assert_eq!(framer.last_path(), Some("/a"));
    }

    #[test]
    fn test_split_delivery() {
        let mut framer = EventStreamFramer::new(0);
        let mut signals = Vec::new();
        for byte in PUT {
            signals.extend(framer.feed(std::slice::from_ref(byte), 0));
        }
        assert_eq!(signals.len(), 1);
    }

    #[test]
    fn test_patch_with_json_data() {
        let mut framer = EventStreamFramer::new(0);
        let signals = framer.feed(
            b"event: patch\ndata: {\"path\":\"/users/u1\",\"data\":{\"name\":\"Ada\",\"age\":36}}\n\n",
            0,
        );
        let StreamSignal::Event(event) = &signals[0] else {
            panic!("expected data event");
        };
        assert!(event.is_patch());
        assert_eq!(event.data_type, DataType::Json);
        assert_eq!(event.raw_data, "{\"name\":\"Ada\",\"age\":36}");
    }

    #[test]
    fn test_keep_alive_resets_idle_timer() {
        let mut framer = EventStreamFramer::new(0)
            .with_keep_alive_timeout(Duration::from_secs(45));
        assert_eq!(framer.poll_timeout(40_000), None);

        let signals = framer.feed(b"event: keep-alive\r\ndata: null\r\n\r\n", 40_000);
        assert_eq!(signals, vec![StreamSignal::KeepAlive]);
        assert_eq!(framer.poll_timeout(80_000), None);
        assert_eq!(framer.poll_timeout(85_000), Some(StreamSignal::Timeout));
        assert_eq!(framer.poll_timeout(90_000), None);
    }

    #[test]
    fn test_control_events() {
        let mut framer = EventStreamFramer::new(0);
        let signals = framer.feed(
            b"event: cancel\ndata: \"Permission denied\"\n\nevent: auth_revoked\ndata: credential is no longer valid\n\n",
            0,
        );
        assert_eq!(
            signals,
            vec![
                StreamSignal::Cancelled {
                    reason: Some("Permission denied".to_string())
                },
                StreamSignal::AuthRevoked
            ]
        );
        assert!(signals[1].requires_reconnect());
    }

    #[test]
    fn test_comments_and_unknown_events_ignored() {
        let mut framer = EventStreamFramer::new(0);
        let signals = framer.feed(b": hello\n\nevent: rules_debug\ndata: x\n\n", 0);
        assert!(signals.is_empty());
    }

    #[test]
    fn test_malformed_envelope_dropped() {
        let mut framer = EventStreamFramer::new(0);
        assert!(framer.feed(b"event: put\ndata: {oops\n\n", 0).is_empty());
        assert_eq!(framer.feed(PUT, 0).len(), 1);
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let mut framer = EventStreamFramer::new(0);
        let line = format!("data: {}\n", "x".repeat(MAX_LINE - 16));
        let mut frame = String::from("event: put\n");
        while frame.len() <= MAX_FRAME {
            frame.push_str(&line);
        }
        frame.push('\n');
        assert!(framer.feed(frame.as_bytes(), 10).is_empty());
        assert!(framer.data.is_empty());

        let signals = framer.feed(PUT, 20);
        assert_eq!(signals.len(), 1);
        assert!(matches!(signals[0], StreamSignal::Event(_)));
    }

    #[test]
    fn test_reset_keeps_last_path() {
        let mut framer = EventStreamFramer::new(0);
        framer.feed(PUT, 0);
        framer.feed(b"event: put\ndata: {\"pa", 0);
        framer.reset(100);
        assert_eq!(framer.last_path(), Some("/a"));
        assert_eq!(framer.feed(PUT, 100).len(), 1);
    }
}
