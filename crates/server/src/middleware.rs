//! Request logging and the auth gate for the protected route group.
//!
//! An `axum::middleware` function wired in with `from_fn`/
//! `from_fn_with_state`, timing the handler and recording one line before
//! and after. The auth gate: missing/invalid bearer token short-circuits
//! with 401 before the handler ever runs.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use crate::state::AppState;

/// Key used to stash the authenticated user's id in request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedUser(pub i64);

pub async fn logging(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::info!(%request_id, %method, %path, "request received");

    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();
    let status = response.status();
    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    tracing::info!(
        %request_id, %method, %path, status = status.as_u16(), duration_ms = duration.as_millis() as u64, bytes,
        "request completed"
    );
    response
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = match req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response(),
    };

    match state.auth.extract_user_id(token) {
        Ok(user_id) => {
            req.extensions_mut().insert(AuthenticatedUser(user_id));
            next.run(req).await
        }
        Err(_) => (StatusCode::UNAUTHORIZED, "invalid or expired token").into_response(),
    }
}
