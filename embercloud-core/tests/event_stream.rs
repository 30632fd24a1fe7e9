//! Integration tests for realtime subscriptions.
//!
//! These tests connect a subscription end to end:
//! - Credentials flow from the state machine into the stream request
//! - Redirects are followed before the event body is read
//! - Chunked event bodies produce typed events and control signals

#![cfg(feature = "stream")]

use std::sync::Arc;

use embercloud_core::http::{HttpSession, SessionOptions};
use embercloud_core::payload::DataType;
use embercloud_core::stream::{StreamConnection, StreamSignal};
use embercloud_core::transport::{Exchange, MemoryClient};
use embercloud_core::{
    AuthConfig, ClientConfig, Clock, CredentialStateMachine, ManualClock, Secret,
    TokenRequestTransport,
};

/// Helper to frame SSE text as one HTTP chunk.
fn chunk(frame: &str) -> String {
    format!("{:x}\r\n{}\r\n", frame.len(), frame)
}

#[test]
fn test_subscription_with_machine_credential() {
    let clock = ManualClock::new(1_700_000_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());

    let config = ClientConfig::new(AuthConfig::Legacy {
        secret: Secret::new("db-secret"),
    });
    let transport = TokenRequestTransport::new(
        Box::new(MemoryClient::new()),
        Arc::clone(&shared),
        SessionOptions::default(),
    );
    let mut machine = CredentialStateMachine::new(&config, transport, Arc::clone(&shared)).unwrap();
    machine.run_until_ready().unwrap();
    let token = machine.handle();

    let handle = MemoryClient::new()
        .with(Exchange::response(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: https://db-eu.example.com/sensors.json?auth=db-secret\r\n\r\n",
        ))
        .with(
            Exchange::new()
                .segment("HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n")
                .segment(chunk("event: put\r\ndata: {\"path\":\"/\",\"data\":{\"temp\":21.5}}\r\n\r\n"))
                .segment(chunk("event: patch\r\ndata: {\"path\":\"/temp\",\"data\":22.25}\r\n\r\n"))
                .segment(chunk("event: keep-alive\r\ndata: null\r\n\r\n"))
                .segment(chunk("event: put\r\ndata: {\"path\":\"/photo\",\"data\":\"blob,base64,aGk=\"}\r\n\r\n"))
                .segment(chunk("event: auth_revoked\r\ndata: credential is no longer valid\r\n\r\n")),
        );
    let session = HttpSession::new(handle.clone(), Arc::clone(&shared));
    let mut stream = StreamConnection::new(session, "db.example.com", "/sensors").with_auth(Box::new(
        move || {
            token
                .credential()
                .ok()
                .and_then(|c| c.query_param().map(str::to_string))
        },
    ));

    stream.connect().unwrap();
    let written = handle.written_string();
    assert!(written.contains("GET /sensors.json?auth=db-secret HTTP/1.1\r\nHost: db.example.com"));
    assert!(written.contains("Host: db-eu.example.com"));

    let mut signals = Vec::new();
    for _ in 0..10 {
        signals.extend(stream.poll().unwrap());
    }
    assert_eq!(signals.len(), 5);

    let StreamSignal::Event(put) = &signals[0] else {
        panic!("expected put, got {:?}", signals[0]);
    };
    assert!(put.is_put());
    assert_eq!(put.data_type, DataType::Json);
    assert_eq!(put.value().to_json().unwrap()["temp"], 21.5);

    let StreamSignal::Event(patch) = &signals[1] else {
        panic!("expected patch, got {:?}", signals[1]);
    };
    assert_eq!(patch.path, "/temp");
    assert_eq!(patch.data_type, DataType::Float);
    assert_eq!(patch.value().to_float(), Some(22.25));

    assert_eq!(signals[2], StreamSignal::KeepAlive);

    let StreamSignal::Event(photo) = &signals[3] else {
        panic!("expected blob, got {:?}", signals[3]);
    };
    assert_eq!(photo.data_type, DataType::Blob);
    assert_eq!(photo.value().decode_binary().unwrap(), b"hi");

    assert_eq!(signals[4], StreamSignal::AuthRevoked);
    assert!(signals[4].requires_reconnect());
    assert_eq!(stream.last_path(), Some("/photo"));
}

#[test]
fn test_stream_ends_with_final_chunk() {
    let clock = ManualClock::new(0);
    let handle = MemoryClient::new().with(
        Exchange::new()
            .segment("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .segment(chunk("event: cancel\ndata: \"Permission denied\"\n\n"))
            .segment("0\r\n\r\n"),
    );
    let session = HttpSession::new(handle.clone(), Arc::new(clock));
    let mut stream = StreamConnection::new(session, "db.example.com", "private");
    stream.connect().unwrap();

    let mut signals = Vec::new();
    while stream.is_open() {
        signals.extend(stream.poll().unwrap());
    }
    assert_eq!(
        signals,
        vec![StreamSignal::Cancelled {
            reason: Some("Permission denied".to_string())
        }]
    );
    assert!(stream.poll().is_err());
}
