//! API-key authentication middleware for the bridge server.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::server::routes::AppState;

/// Middleware that resolves `Authorization: Bearer <api-key>` against the
/// pairing store. The resolved [`PairingRecord`](crate::pairing::PairingRecord)
/// is attached to the request for handlers; anything else is turned away
/// before it can reach the approval queue.
pub async fn require_pairing(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(api_key) = presented else {
        return unauthorized();
    };

    match state.store.authorize(api_key).await {
        Ok(record) => {
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        Err(_) => {
            tracing::warn!("bridge call with unknown API key");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({"error": "Unknown or invalid API key"})),
    )
        .into_response()
}
