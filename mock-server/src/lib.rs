//! Test HTTP server exercised by the engine's integration tests.
//!
//! Stateless endpoints only: fixed bodies, deterministic byte streams, an
//! echo route for request-body round-trips, and an inspection route that
//! reports what the request looked like on the wire.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, RawQuery},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::stream;
use serde::Deserialize;
use tokio::net::TcpListener;

pub fn app() -> Router {
    Router::new()
        .route("/ok", get(ok))
        .route("/bytes/{n}", get(bytes_of))
        .route("/echo", post(echo).put(echo))
        .route("/status/{code}", get(status))
        .route("/inspect", post(inspect))
        .route("/slow", get(slow))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Deterministic body used by the byte-stream endpoint, reproducible on the
/// asserting side.
pub fn pattern(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i % 251) as u8).collect()
}

async fn ok() -> &'static str {
    "ok"
}

/// `n` pattern bytes, delivered in chunks of at most 256 bytes so streaming
/// readers observe multiple frames.
async fn bytes_of(Path(n): Path<usize>) -> impl IntoResponse {
    let chunks: Vec<Result<Bytes, Infallible>> = pattern(n)
        .chunks(256)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    Body::from_stream(stream::iter(chunks))
}

async fn echo(body: Bytes) -> Bytes {
    body
}

async fn status(Path(code): Path<u16>) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Report the request's content type, query string, and body size.
async fn inspect(
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Json<serde_json::Value> {
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    Json(serde_json::json!({
        "content_type": content_type,
        "query": query.unwrap_or_default(),
        "len": body.len(),
    }))
}

#[derive(Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

async fn slow(Query(params): Query<SlowParams>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(params.ms.unwrap_or(25))).await;
    "done"
}
