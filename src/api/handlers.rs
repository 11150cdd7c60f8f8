//! Lookup handlers.

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::State;
use axum::http::Uri;
use axum::Json;
use tracing::{error, field, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::AppState;
use crate::error::LookupError;
use crate::metrics;
use crate::model::{InputMode, LookupRequest, LookupResponse};

/// `/postURL`: image given by URL.
pub async fn url_lookup(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<LookupResponse>, LookupError> {
    run_lookup(state, InputMode::Url, body.map_err(body_error)).await
}

/// Any other path: image given inline as base64.
pub async fn inline_lookup(
    State(state): State<AppState>,
    uri: Uri,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<LookupResponse>, LookupError> {
    run_lookup(state, InputMode::from_path(uri.path()), body.map_err(body_error)).await
}

/// Unreadable or oversized bodies are reported like any other bad request.
fn body_error(rejection: BytesRejection) -> LookupError {
    LookupError::BadRequest(rejection.body_text())
}

async fn run_lookup(
    state: AppState,
    mode: InputMode,
    body: Result<Bytes, LookupError>,
) -> Result<Json<LookupResponse>, LookupError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("lookup", %request_id, mode = mode.as_str(), k = field::Empty);

    async move {
        let request =
            body.and_then(|body| LookupRequest::from_body(mode, &body, state.max_neighbors));
        let outcome = match request {
            Ok(request) => {
                Span::current().record("k", request.neighbor_count.get());
                state.pipeline.lookup(&request).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(links) => {
                metrics::record_request(mode, "ok");
                metrics::record_results(links.len());
                Ok(Json(LookupResponse::from(links)))
            }
            Err(err) => {
                if err.is_client_error() {
                    warn!(kind = %err.kind(), error = %err, "lookup rejected");
                } else {
                    error!(kind = %err.kind(), error = %err, "lookup failed");
                }
                metrics::record_request(mode, err.kind().as_str());
                Err(err)
            }
        }
    }
    .instrument(span)
    .await
}
