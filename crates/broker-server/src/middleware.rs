use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

use crate::AppState;

/// Rejects any request whose `Authorization` header does not match the
/// configured API key, before any handler runs.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == state.config.api_key => next.run(req).await,
        _ => (StatusCode::FORBIDDEN, "invalid or missing API key").into_response(),
    }
}
