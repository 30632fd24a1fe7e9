//! Live subscription to a database path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use embercloud_core::http::HttpSession;
use embercloud_core::stream::{AuthQuery, ReconnectBackoff, StreamConnection, StreamWorker, WorkerEvent};
use embercloud_core::{
    ClientConfig, Clock, CredentialStateMachine, SystemClock, TcpClient, TokenHandle, TokenInfo,
    TokenRequestTransport,
};

use crate::replay::describe_signal;

/// Interval between credential state machine ticks once a token is held.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

/// `auth=` query supplier backed by the live token.
///
/// Bearer credentials cannot ride on the query string, so they yield no
/// `auth` value.
fn stream_auth(token: TokenHandle) -> AuthQuery {
    Box::new(move || match token.credential() {
        Ok(credential) => credential.query_param().map(str::to_string),
        Err(e) => {
            tracing::warn!("No credential for stream request: {}", e);
            None
        }
    })
}

/// Render one worker event as an output line.
fn describe_event(event: &WorkerEvent) -> Result<String> {
    Ok(match event {
        WorkerEvent::Connected => "connected".to_string(),
        WorkerEvent::Signal(signal) => describe_signal(signal)?,
        WorkerEvent::Disconnected { error } => format!("disconnected: {} (code {})", error, error.code()),
    })
}

/// Subscribe to `path` and print events until Ctrl+C.
pub async fn listen(config: ClientConfig, path: String, port: Option<u16>) -> Result<()> {
    let endpoint = config.database_endpoint()?;
    let port = port.unwrap_or(endpoint.port);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let transport = TokenRequestTransport::new(
        Box::new(TcpClient::new()),
        Arc::clone(&clock),
        config.token_session_options(),
    );
    let mut machine = CredentialStateMachine::new(&config, transport, Arc::clone(&clock))?
        .with_observer(|info: &TokenInfo| match &info.error {
            Some(error) => tracing::warn!("Token {}: {} ({})", info.status, error.message, error.code),
            None => tracing::info!("Token {} ({})", info.status, info.token_type),
        });
    let token = machine.handle();

    let mut machine = tokio::task::spawn_blocking(move || {
        machine.run_until_ready().map(|_| machine)
    })
    .await?
    .context("Failed to obtain a credential")?;

    // Keep the token fresh for reconnects.
    let stop = Arc::new(AtomicBool::new(false));
    let ticker = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Acquire) {
                machine.tick();
                std::thread::sleep(TICK_INTERVAL);
            }
        })
    };

    let session = HttpSession::new(TcpClient::new(), Arc::clone(&clock)).with_options(config.session_options());
    let connection = StreamConnection::new(session, endpoint.host.clone(), path.clone())
        .with_port(port)
        .with_keep_alive_timeout(config.timeouts.stream_keep_alive())
        .with_auth(stream_auth(token));
    let backoff = ReconnectBackoff::new(
        config.timeouts.stream_reconnect(),
        config.timeouts.stream_reconnect_max(),
    );
    let (worker, mut events) = StreamWorker::spawn(connection, backoff)?;
    tracing::info!("Listening on {}:{} at {}", endpoint.host, port, path);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", describe_event(&event)?),
                None => break,
            },
        }
    }

    stop.store(true, Ordering::Release);
    tokio::task::spawn_blocking(move || worker.join()).await?;
    ticker.await?;
    Ok(())
}
