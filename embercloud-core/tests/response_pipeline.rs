//! Integration tests for the response pipeline.
//!
//! These tests drive complete exchanges through a scripted client:
//! - Chunked bodies carrying inline blobs, decoded straight to a file
//! - Redirect chains and their limit
//! - Server errors reported inside 200 responses
//! - Push names and ETags

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use embercloud_core::error::{code, describe};
use embercloud_core::http::{HttpError, HttpSession, Request};
use embercloud_core::payload::{
    classify, ByteSink as _, DataType, DownloadTarget, InlineBase64Decoder, OpenMode,
};
use embercloud_core::transport::{Exchange, MemoryClient, TransportError};
use embercloud_core::ManualClock;
use tempfile::TempDir;

/// Helper to create a session over a scripted client.
fn session(handle: &MemoryClient) -> HttpSession<MemoryClient> {
    HttpSession::new(handle.clone(), Arc::new(ManualClock::new(0)))
}

/// Helper to wrap `body` in a chunked response, one chunk per `chunk` bytes.
fn chunked_response(body: &str, chunk: usize) -> String {
    let mut response = String::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n");
    for piece in body.as_bytes().chunks(chunk) {
        response.push_str(&format!("{:x}\r\n", piece.len()));
        response.push_str(std::str::from_utf8(piece).unwrap());
        response.push_str("\r\n");
    }
    response.push_str("0\r\n\r\n");
    response
}

#[test]
fn test_chunked_blob_streams_to_file() {
    let original: Vec<u8> = (0..5000u32).map(|i| (i * 31 % 251) as u8).collect();
    let body = format!("\"blob,base64,{}\"", STANDARD.encode(&original));
    let handle = MemoryClient::new().with(Exchange::split_every(chunked_response(&body, 700), 97));
    let mut session = session(&handle);

    let temp = TempDir::new().unwrap();
    let path = temp.path().join("blob.bin");
    let mut sink = DownloadTarget::File {
        path: path.clone(),
        mode: OpenMode::Write,
    }
    .open()
    .unwrap();
    let mut decoder = InlineBase64Decoder::new();
    let mut head = String::new();
    let mut failure = None;

    let request = Request::get("db.example.com", "/firmware/blob.json");
    let state = session
        .send_streaming(&request, &mut |bytes: &[u8]| {
            if head.is_empty() {
                head = String::from_utf8_lossy(bytes).into_owned();
            }
            if failure.is_none() {
                if let Err(e) = decoder.feed(bytes, &mut sink) {
                    failure = Some(e);
                }
            }
            Ok(())
        })
        .unwrap();
    sink.close().unwrap();

    assert!(state.chunked);
    assert!(failure.is_none());
    assert_eq!(classify(&head, 0).data_type, DataType::Blob);
    assert_eq!(decoder.finish().unwrap(), original.len());
    assert_eq!(std::fs::read(&path).unwrap(), original);
}

#[test]
fn test_redirect_limit() {
    let handle = MemoryClient::new();
    for hop in 0..6 {
        handle.push(Exchange::response(format!(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: https://hop{hop}.example.com/data.json\r\nContent-Length: 0\r\n\r\n"
        )));
    }
    let mut session = session(&handle);

    let err = session
        .send(&Request::get("db.example.com", "/data.json"))
        .unwrap_err();
    assert_eq!(err, HttpError::Transport(TransportError::MaxRedirects { max: 5 }));
    assert_eq!(err.code(), code::MAX_REDIRECTS);
    assert_eq!(describe(err.code()), "maximum redirection reached");
    assert_eq!(handle.connections().len(), 6);
    assert_eq!(handle.connections()[5].0, "hop4.example.com");
}

#[test]
fn test_redirect_then_success() {
    let handle = MemoryClient::new()
        .with(Exchange::response(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: https://db-2.example.com/a.json?x=1\r\n\r\n",
        ))
        .with(Exchange::response(
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nETag: \"abc\"\r\n\r\n42",
        ));
    let mut session = session(&handle);

    let response = session.send(&Request::get("db.example.com", "/a.json")).unwrap();
    assert_eq!(response.text(), "42");
    assert_eq!(response.state.etag.as_deref(), Some("\"abc\""));
    assert!(handle.written_string().contains("GET /a.json?x=1 HTTP/1.1\r\nHost: db-2.example.com"));

    let mut state = response.state.clone();
    let text = response.text();
    let classification = state.classify_payload(&text, 0);
    assert_eq!(classification.data_type, DataType::Integer);
}

#[test]
fn test_error_inside_ok_response() {
    let body = r#"{"error" : "Permission denied"}"#;
    let handle = MemoryClient::new().with(Exchange::response(format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )));
    let mut session = session(&handle);

    let response = session.send(&Request::get("db.example.com", "/secret.json")).unwrap();
    assert_eq!(response.state.server_error_message.as_deref(), Some("Permission denied"));
    let err = response.check().unwrap_err();
    assert_eq!(
        err,
        HttpError::Server {
            status: 200,
            message: "Permission denied".to_string()
        }
    );
}

#[test]
fn test_push_name_captured() {
    let body = r#"{"name":"-NxyzAbc123"}"#;
    let handle = MemoryClient::new().with(Exchange::response(format!(
        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )));
    let mut session = session(&handle);

    let request = Request::post("db.example.com", "/logs.json").with_json(&serde_json::json!({"t": 1}));
    let response = session.send(&request).unwrap();
    assert_eq!(response.state.push_name.as_deref(), Some("-NxyzAbc123"));
    assert!(session.endpoint().is_some());
}

#[test]
fn test_not_found_status_text() {
    let handle = MemoryClient::new().with(Exchange::response(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    ));
    let mut session = session(&handle);

    let err = session
        .send(&Request::get("db.example.com", "/missing.json"))
        .unwrap()
        .check()
        .unwrap_err();
    assert_eq!(err.code(), 404);
    assert_eq!(describe(err.code()), "not found");
}
