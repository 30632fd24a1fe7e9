//! Offline replay of captured traffic through the pipeline.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use embercloud_core::http::{ChunkedBodyDecoder, ResponseHeaderParser, ResponseState};
use embercloud_core::payload::{ByteSink as _, DownloadTarget, InlineBase64Decoder, OpenMode, TypedValue};
use embercloud_core::stream::{EventStreamFramer, StreamSignal};
use serde::Serialize;

/// Fragment size used when replaying, to exercise incremental decoding.
const REPLAY_FRAGMENT: usize = 512;

/// What a captured response decodes to.
#[derive(Debug, Serialize)]
pub struct ResponseSummary {
    pub status: u16,
    pub chunked: bool,
    pub content_length: Option<usize>,
    pub etag: Option<String>,
    pub location: Option<String>,
    pub push_name: Option<String>,
    pub server_error: Option<String>,
    pub data_type: String,
    pub body: String,
}

/// Parse a raw HTTP response (status line, headers and body).
pub fn decode_response(raw: &[u8]) -> Result<ResponseSummary> {
    let mut parser = ResponseHeaderParser::new();
    let mut rest = raw;
    loop {
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            bail!("response ended inside the header block");
        };
        let line = rest[..end].strip_suffix(b"\r").unwrap_or(&rest[..end]);
        rest = &rest[end + 1..];
        if parser.feed_line(line)? {
            break;
        }
    }
    let mut state = parser.into_state();

    let body = if state.chunked {
        let mut decoder = ChunkedBodyDecoder::new();
        let mut body = Vec::new();
        for fragment in rest.chunks(REPLAY_FRAGMENT) {
            decoder.decode_into(fragment, &mut body)?;
            if decoder.is_done() {
                break;
            }
        }
        decoder.finish()?;
        body
    } else {
        match state.content_length {
            Some(length) if length > rest.len() => {
                bail!("body holds {} of {} announced bytes", rest.len(), length)
            }
            Some(length) => rest[..length].to_vec(),
            None => rest.to_vec(),
        }
    };
    state.inspect_body(&body);
    Ok(summarize(state, &body))
}

fn summarize(mut state: ResponseState, body: &[u8]) -> ResponseSummary {
    let text = String::from_utf8_lossy(body).into_owned();
    let classification = state.classify_payload(&text, 0);
    let value = TypedValue::with_classification(&text, classification);
    ResponseSummary {
        status: state.http_code,
        chunked: state.chunked,
        content_length: state.content_length,
        etag: state.etag.take(),
        location: state.location.take(),
        push_name: state.push_name.take(),
        server_error: state.server_error_message.take(),
        data_type: classification.data_type.to_string(),
        body: value.to_string_value().unwrap_or_default(),
    }
}

/// Replay an event-stream body and return the signals it yields.
pub fn decode_stream(raw: &[u8], chunked: bool) -> Result<Vec<StreamSignal>> {
    let mut framer = EventStreamFramer::new(0);
    let mut decoder = chunked.then(ChunkedBodyDecoder::new);
    let mut signals = Vec::new();
    let mut decoded = Vec::new();
    for fragment in raw.chunks(REPLAY_FRAGMENT) {
        let body = match decoder.as_mut() {
            Some(decoder) => {
                decoded.clear();
                decoder.decode_into(fragment, &mut decoded)?;
                &decoded[..]
            }
            None => fragment,
        };
        signals.extend(framer.feed(body, 0));
    }
    Ok(signals)
}

/// One line of `decode-stream` output.
pub fn describe_signal(signal: &StreamSignal) -> Result<String> {
    Ok(match signal {
        StreamSignal::Event(event) => serde_json::to_string(event)?,
        StreamSignal::KeepAlive => "keep-alive".to_string(),
        StreamSignal::Cancelled { reason } => {
            format!("cancel: {}", reason.as_deref().unwrap_or("no reason given"))
        }
        StreamSignal::AuthRevoked => "auth revoked".to_string(),
        StreamSignal::Timeout => "timeout".to_string(),
    })
}

/// Decode an inline `"blob,base64,..."` value from `input` into `output`.
pub fn decode_blob(input: &Path, output: &Path, append: bool) -> Result<usize> {
    let raw = std::fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
    let mode = if append { OpenMode::Append } else { OpenMode::Write };
    let mut sink = DownloadTarget::File {
        path: output.to_path_buf(),
        mode,
    }
    .open()
    .with_context(|| format!("Failed to open {:?}", output))?;

    let mut decoder = InlineBase64Decoder::new();
    for fragment in raw.chunks(REPLAY_FRAGMENT) {
        decoder.feed(fragment, &mut sink)?;
        if decoder.is_done() {
            break;
        }
    }
    sink.close()?;
    let written = decoder.finish()?;
    tracing::debug!("Decoded {:?} value into {:?}", decoder.kind(), output);
    Ok(written)
}

/// Print a response summary as text or JSON.
pub fn print_summary(summary: &ResponseSummary, json: bool, out: &mut dyn Write) -> Result<()> {
    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(summary)?)?;
        return Ok(());
    }
    writeln!(out, "Status:    {}", summary.status)?;
    writeln!(out, "Chunked:   {}", summary.chunked)?;
    if let Some(length) = summary.content_length {
        writeln!(out, "Length:    {}", length)?;
    }
    for (label, value) in [
        ("ETag:     ", &summary.etag),
        ("Location: ", &summary.location),
        ("Push name:", &summary.push_name),
        ("Error:    ", &summary.server_error),
    ] {
        if let Some(value) = value {
            writeln!(out, "{} {}", label, value)?;
        }
    }
    writeln!(out, "Type:      {}", summary.data_type)?;
    writeln!(out, "Value:     {}", summary.body)?;
    Ok(())
}
