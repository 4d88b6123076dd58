//! In-process handler for the synthetic URL scheme.
//!
//! Serves `GET /v/{entity_id}` from the [`ContentStore`] with single-range
//! HTTP semantics: full 200 without a `Range` header, 206 with
//! `Content-Range` for a valid range, 400 for a malformed header, 416 with
//! `Content-Range: bytes */{total}` for an unsatisfiable one, and 404 on a
//! store miss. Clients cannot tell the synthetic URL from a network URL.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;

use crate::store::ContentStore;

/// Outcome of parsing a `Range` header against a payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeOutcome {
    /// No range requested; serve the full payload.
    Full,
    /// The header did not match `bytes=start-end?`.
    Malformed,
    /// The range was syntactically valid but unsatisfiable.
    Unsatisfiable,
    /// A satisfiable inclusive byte range.
    Range(u64, u64),
}

/// Parses a single-range `Range` header.
///
/// Accepted form is `bytes=start-end?` with an optional inclusive `end`
/// defaulting to the last byte. Multi-range and suffix forms are rejected
/// as malformed.
fn parse_range(header: Option<&str>, total: u64) -> RangeOutcome {
    let Some(header) = header else {
        return RangeOutcome::Full;
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Malformed;
    };
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Malformed;
    };
    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeOutcome::Malformed;
    };
    let end = if end_raw.is_empty() {
        if total == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        total - 1
    } else {
        let Ok(end) = end_raw.parse::<u64>() else {
            return RangeOutcome::Malformed;
        };
        end
    };

    if end >= total || start > end {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Range(start, end)
}

/// Serves one entity's payload with single-range semantics.
pub async fn serve_content(
    State(store): State<Arc<ContentStore>>,
    Path(entity_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some((entry, body)) = store.get(&entity_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let total = entry.byte_length;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    match parse_range(range_header, total) {
        RangeOutcome::Full => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, entry.mime_type),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            body,
        )
            .into_response(),
        RangeOutcome::Malformed => StatusCode::BAD_REQUEST.into_response(),
        RangeOutcome::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{total}"))],
        )
            .into_response(),
        RangeOutcome::Range(start, end) => {
            // Bounds were validated against the payload length above.
            #[allow(clippy::cast_possible_truncation)]
            let slice: Bytes = body.slice(start as usize..=end as usize);
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, entry.mime_type),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {start}-{end}/{total}"),
                    ),
                    (header::CONTENT_LENGTH, (end - start + 1).to_string()),
                ],
                slice,
            )
                .into_response()
        }
    }
}

/// Assembles the router serving the synthetic URL scheme.
///
/// Routes:
/// - `GET /v/{entity_id}` -- payload bytes with range support
#[must_use]
pub fn content_router(store: Arc<ContentStore>) -> Router {
    Router::new()
        .route("/v/{entity_id}", get(serve_content))
        .with_state(store)
}
