//! Token status notifications.

use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{TokenInfo, TokenStatus};

/// Receives token status changes.
pub trait TokenObserver: Send {
    fn on_token_status(&mut self, info: &TokenInfo);
}

impl<F: FnMut(&TokenInfo) + Send> TokenObserver for F {
    fn on_token_status(&mut self, info: &TokenInfo) {
        self(info)
    }
}

/// Forwards status changes onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<TokenInfo>,
}

impl ChannelObserver {
    /// Create an observer and the receiving end of its channel.
    pub fn channel() -> (Self, UnboundedReceiver<TokenInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TokenObserver for ChannelObserver {
    fn on_token_status(&mut self, info: &TokenInfo) {
        if self.tx.send(info.clone()).is_err() {
            tracing::trace!("Token status receiver dropped");
        }
    }
}

/// Delivers status changes, letting errors through at most once per
/// interval.
///
/// Repeated failures would otherwise call the observer on every retry.
pub struct RateLimitedNotifier {
    observer: Box<dyn TokenObserver>,
    interval: Duration,
    last_error: Option<u64>,
    suppressed: usize,
}

impl RateLimitedNotifier {
    /// Wrap `observer`, limiting error reports to one per `interval`.
    pub fn new(observer: Box<dyn TokenObserver>, interval: Duration) -> Self {
        Self {
            observer,
            interval,
            last_error: None,
            suppressed: 0,
        }
    }

    /// Error reports dropped since the last delivered one.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// Deliver `info` unless it is an error inside the quiet interval.
    ///
    /// Returns whether the observer was called.
    pub fn notify(&mut self, info: &TokenInfo, now_millis: u64) -> bool {
        if info.status == TokenStatus::Error {
            let interval = self.interval.as_millis() as u64;
            if let Some(last) = self.last_error {
                if now_millis.saturating_sub(last) < interval {
                    self.suppressed += 1;
                    return false;
                }
            }
            if self.suppressed > 0 {
                tracing::debug!("Suppressed {} token error notifications", self.suppressed);
            }
            self.last_error = Some(now_millis);
            self.suppressed = 0;
        }
        self.observer.on_token_status(info);
        true
    }
}

impl std::fmt::Debug for RateLimitedNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedNotifier")
            .field("interval", &self.interval)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}
