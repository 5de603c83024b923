//! Request forwarding to model subprocesses with streaming bodies.
//!
//! Bytes flow through chunk by chunk in both directions; nothing is
//! buffered beyond the routing prefix. This is what makes server-sent
//! events and chunked chat-completion streaming arrive as they are
//! produced rather than at end of response.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt, stream};
use reqwest::Client;
use tracing::{debug, error};

use clara_runtime::RequestGuard;

use crate::body::PeekedBody;
use crate::models::ErrorResponse;

/// Headers that must NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // Also strip these for correctness at the boundary
    "host",
    "content-length",
    "authorization", // boundary auth is not the subprocess's business
];

/// Check if a header should be forwarded.
fn should_forward_header(name: &str) -> bool {
    let lower = name.to_lowercase();
    !HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// Forward a request to the upstream subprocess and stream the response
/// back.
///
/// The request body is the peeked prefix followed by the unread tail.
/// The response is returned as soon as upstream headers arrive; the body
/// streams through afterwards. Connection failures before headers map to
/// 502; failures mid-stream truncate the response.
pub async fn forward_request(
    client: &Client,
    base_url: &str,
    parts: Parts,
    peeked: PeekedBody,
) -> Response {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let upstream_url = format!("{base_url}{path_and_query}");
    debug!(url = %upstream_url, "forwarding request");

    let mut forward_headers = reqwest::header::HeaderMap::new();
    for (name, value) in &parts.headers {
        if should_forward_header(name.as_str()) {
            forward_headers.append(name.clone(), value.clone());
        }
    }
    let req_builder = client
        .request(parts.method, &upstream_url)
        .headers(forward_headers);

    let request_body = match peeked.rest {
        // Small body, fully buffered: send it as-is.
        None => reqwest::Body::from(peeked.prefix),
        // Large body: replay the prefix, then stream the remainder.
        Some(rest) => {
            let replay = stream::once(async move { Ok::<_, std::io::Error>(peeked.prefix) });
            let tail = rest.map_err(std::io::Error::other);
            reqwest::Body::wrap_stream(replay.chain(tail))
        }
    };

    let response = match req_builder.body(request_body).send().await {
        Ok(response) => response,
        Err(e) => {
            error!(url = %upstream_url, error = %e, "failed to reach subprocess");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(ErrorResponse::upstream_error(&e.to_string())),
            )
                .into_response();
        }
    };

    let status = response.status();
    let mut headers = axum::http::HeaderMap::new();
    for (name, value) in response.headers() {
        if should_forward_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let body = Body::from_stream(response.bytes_stream().map_err(std::io::Error::other));
    let mut out = Response::new(body);
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Tie an admission guard to the response body.
///
/// The guard drops when the body finishes or the client disconnects,
/// releasing the in-flight slot and refreshing the model's idle clock at
/// the true end of the request.
pub fn attach_guard(response: Response, guard: RequestGuard) -> Response {
    let (parts, body) = response.into_parts();
    let stream = GuardedStream {
        inner: body.into_data_stream().boxed(),
        _guard: guard,
    };
    Response::from_parts(parts, Body::from_stream(stream))
}

struct GuardedStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    _guard: RequestGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
