//! Background subscription thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{ReconnectBackoff, StreamConnection, StreamSignal};
use crate::http::HttpError;
use crate::transport::{Client, TransportError};

/// What the worker reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The subscription is open.
    Connected,
    /// A signal from the framer.
    Signal(StreamSignal),
    /// The subscription dropped; the worker reconnects after a backoff.
    Disconnected { error: HttpError },
}

/// A thread that owns a [`StreamConnection`] and reports on a channel.
///
/// The worker reconnects on errors with [`ReconnectBackoff`] delays and
/// immediately on timeouts and revoked credentials. It stops when
/// [`stop`](Self::stop) is called, when the handle is dropped, or when the
/// receiver goes away.
pub struct StreamWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Start the worker.
    pub fn spawn<C: Client + 'static>(
        connection: StreamConnection<C>,
        backoff: ReconnectBackoff,
    ) -> std::io::Result<(Self, UnboundedReceiver<WorkerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("embercloud-stream".to_string())
            .spawn(move || run(connection, backoff, flag, tx))?;
        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            rx,
        ))
    }

    /// Ask the worker to stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for the thread to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Stream worker panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<C: Client>(
    mut connection: StreamConnection<C>,
    mut backoff: ReconnectBackoff,
    stop: Arc<AtomicBool>,
    tx: UnboundedSender<WorkerEvent>,
) {
    let clock = Arc::clone(connection.session_mut().clock());
    let mut next_attempt = 0u64;
    tracing::debug!("Stream worker started for {}", connection.path());

    while !stop.load(Ordering::Acquire) {
        let now = clock.now_millis();
        if !connection.is_open() {
            if now < next_attempt {
                clock.idle();
                continue;
            }
            let event = match connection.connect() {
                Ok(()) => {
                    backoff.reset();
                    WorkerEvent::Connected
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Stream connect failed: {}; retrying in {:?}", error, delay);
                    next_attempt = now + delay.as_millis() as u64;
                    WorkerEvent::Disconnected { error }
                }
            };
            if tx.send(event).is_err() {
                break;
            }
            continue;
        }

        let signals = match connection.poll() {
            Ok(signals) => signals,
            Err(error) => {
                next_attempt = now + backoff.next_delay().as_millis() as u64;
                if tx.send(WorkerEvent::Disconnected { error }).is_err() {
                    break;
                }
                continue;
            }
        };
        let idle = signals.is_empty();
        let mut reconnect = false;
        for signal in signals {
            reconnect |= signal.requires_reconnect();
            if tx.send(WorkerEvent::Signal(signal)).is_err() {
                connection.close();
                return;
            }
        }
        if reconnect {
            tracing::info!("Reopening stream at {}", connection.path());
            connection.close();
            next_attempt = 0;
        } else if !connection.is_open() {
            next_attempt = now + backoff.next_delay().as_millis() as u64;
            let error = HttpError::Transport(TransportError::ConnectionLost);
            if tx.send(WorkerEvent::Disconnected { error }).is_err() {
                break;
            }
        }
        if idle {
            clock.idle();
        }
    }
    connection.close();
    tracing::debug!("Stream worker stopped");
}
