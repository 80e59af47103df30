//! Local HTTP gateway exposing the active distribution unit as a
//! byte-range stream, so an ordinary media player can consume a file that
//! is still replicating.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{stream, StreamExt};

use crate::error::FabricError;
use crate::swarm::SwarmManager;

/// Body chunk granularity. Each chunk waits only for its own covering
/// pieces, so playback can start while the tail is still replicating.
const STREAM_CHUNK: u64 = 64 * 1024;

// ── Gateway ─────────────────────────────────────────────────────────────────

pub fn router(swarm: SwarmManager) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .with_state(swarm)
}

/// Bind the gateway and serve it in the background. Returns the bound
/// address; port 0 picks a free port.
pub async fn serve(swarm: SwarmManager, addr: SocketAddr) -> Result<SocketAddr, FabricError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("gateway listening on http://{local_addr}/stream");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(swarm)).await {
            log::error!("gateway stopped: {e}");
        }
    });
    Ok(local_addr)
}

/// `GET /stream`, with optional `Range`.
///
/// Blocks until the active unit's metadata is known, then until every
/// piece covering the requested range has replicated. A unit torn down
/// while a request is waiting turns into 503; no unit at all is 404.
async fn stream(State(swarm): State<SwarmManager>, headers: HeaderMap) -> Response {
    let (name, length) = match swarm.wait_ready().await {
        Ok(meta) => meta,
        Err(FabricError::NoActiveUnit) => return StatusCode::NOT_FOUND.into_response(),
        Err(FabricError::UnitReplaced) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(e) => {
            log::error!("readiness wait failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    match range {
        None => respond(swarm, &name, length, 0, length.saturating_sub(1), false).await,
        Some(raw) => match parse_range(raw, length) {
            Some((start, end)) => respond(swarm, &name, length, start, end, true).await,
            None => build(
                Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{length}"))
                    .body(Body::empty()),
            ),
        },
    }
}

async fn respond(
    swarm: SwarmManager,
    name: &str,
    length: u64,
    start: u64,
    end: u64,
    partial: bool,
) -> Response {
    // The first chunk is fetched up front so a unit torn down before any
    // byte went out still turns into a clean status.
    let first_end = end.min(start + STREAM_CHUNK - 1);
    let first = match swarm.read_range(start, first_end).await {
        Ok(bytes) => bytes,
        Err(FabricError::UnitReplaced) | Err(FabricError::NoActiveUnit) => {
            return StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
        Err(e) => {
            log::error!("range read {start}-{end} failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let rest = stream::try_unfold(first_end + 1, move |pos| {
        let swarm = swarm.clone();
        async move {
            if pos > end {
                return Ok(None);
            }
            let chunk_end = end.min(pos + STREAM_CHUNK - 1);
            let bytes = swarm.read_range(pos, chunk_end).await?;
            Ok::<_, FabricError>(Some((bytes, chunk_end + 1)))
        }
    });
    let body = Body::from_stream(stream::iter([Ok::<_, FabricError>(first)]).chain(rest));

    let mut builder = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, content_type(name))
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, end - start + 1);
    if partial {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{length}"));
    }
    build(builder.body(body))
}

fn build(result: Result<Response, axum::http::Error>) -> Response {
    result.unwrap_or_else(|e| {
        log::error!("response build failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

/// Parse a `Range` header against a file of `length` bytes into an
/// inclusive satisfiable byte range. Only the first range of a multi-range
/// request is honored; ends past the file are clamped.
fn parse_range(raw: &str, length: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let spec = spec.split(',').next()?.trim();
    let (from, to) = spec.split_once('-')?;
    let clamp = length.checked_sub(1)?;
    match (from.is_empty(), to.is_empty()) {
        (false, false) => {
            let start: u64 = from.parse().ok()?;
            let end: u64 = to.parse().ok()?;
            (start <= end && start <= clamp).then(|| (start, end.min(clamp)))
        }
        (false, true) => {
            let start: u64 = from.parse().ok()?;
            (start <= clamp).then_some((start, clamp))
        }
        (true, false) => {
            let suffix: u64 = to.parse().ok()?;
            (suffix > 0).then(|| (length.saturating_sub(suffix), clamp))
        }
        (true, true) => None,
    }
}

fn content_type(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match extension.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}
