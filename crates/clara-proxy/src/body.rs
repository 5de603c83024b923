//! Non-destructive `model` extraction from request bodies.
//!
//! The multiplexer needs the `model` field (and the `stream` flag) before
//! it can route, but it must not materialize arbitrarily large uploads.
//! Bodies are buffered up to a 1 MiB cap: if the JSON completes within
//! the cap it is parsed outright, otherwise a bounded scanner pulls the
//! two fields out of the prefix. Whatever was buffered is replayed in
//! front of the remaining stream when forwarding upstream.

use axum::body::{Body, BodyDataStream};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::Deserialize;

/// How much of a body is buffered while looking for `model`.
pub const MODEL_PEEK_CAP: usize = 1024 * 1024;

/// A body split into the inspected prefix and the untouched tail.
pub struct PeekedBody {
    /// Value of the JSON `model` field, when found.
    pub model: Option<String>,
    /// Value of the JSON `stream` field; false when absent.
    pub stream: bool,
    /// Everything read so far. Forwarded upstream ahead of `rest`.
    pub prefix: Bytes,
    /// The unread remainder, present only when the cap was hit.
    pub rest: Option<BodyDataStream>,
}

#[derive(Deserialize)]
struct PeekFields {
    model: Option<String>,
    #[serde(default)]
    stream: bool,
}

/// Read up to [`MODEL_PEEK_CAP`] bytes of `body` and extract the routing
/// fields.
///
/// # Errors
///
/// Propagates body read errors (client disconnect mid-upload).
pub async fn peek_model(body: Body) -> Result<PeekedBody, axum::Error> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    let mut rest = None;

    loop {
        if buf.len() >= MODEL_PEEK_CAP {
            rest = Some(stream);
            break;
        }
        match stream.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }

    let (model, stream_flag) = if rest.is_none() {
        match serde_json::from_slice::<PeekFields>(&buf) {
            Ok(fields) => (fields.model, fields.stream),
            // Malformed or non-JSON body; fall back to the scanner so a
            // prefix-valid document still routes.
            Err(_) => scan_fields(&buf),
        }
    } else {
        scan_fields(&buf)
    };

    Ok(PeekedBody {
        model,
        stream: stream_flag,
        prefix: buf.freeze(),
        rest,
    })
}

/// Pull `model` and `stream` out of a JSON prefix without a full parse.
fn scan_fields(data: &[u8]) -> (Option<String>, bool) {
    let text = String::from_utf8_lossy(data);
    let model = scan_string_field(&text, "model");
    let stream = scan_bool_field(&text, "stream").unwrap_or(false);
    (model, stream)
}

/// Find `"key": "value"` in `text` and return the unescaped value.
fn scan_string_field(text: &str, key: &str) -> Option<String> {
    let value = scan_value(text, key)?;
    let rest = value.strip_prefix('"')?;

    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => out.push(chars.next()?),
            other => out.push(other),
        }
    }
    // Value truncated by the peek cap.
    None
}

/// Find `"key": true|false` in `text`.
fn scan_bool_field(text: &str, key: &str) -> Option<bool> {
    let value = scan_value(text, key)?;
    if value.starts_with("true") {
        Some(true)
    } else if value.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

/// Text immediately following `"key" :`, whitespace skipped.
fn scan_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let mut search_from = 0;
    while let Some(pos) = text[search_from..].find(&needle) {
        let after_key = search_from + pos + needle.len();
        let rest = text[after_key..].trim_start();
        if let Some(rest) = rest.strip_prefix(':') {
            return Some(rest.trim_start());
        }
        // Matched a string that merely contains the key; keep looking.
        search_from = after_key;
    }
    None
}
