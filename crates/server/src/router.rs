//! Route mounting: a public group (register/login) and a protected group
//! gated by the auth middleware.

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::{logging, require_auth};
use crate::state::AppState;

pub fn build(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/user/orders", post(handlers::submit_order).get(handlers::list_orders))
        .route("/api/user/balance", get(handlers::get_balance))
        .route("/api/user/balance/withdraw", post(handlers::withdraw))
        .route("/api/user/withdrawals", get(handlers::list_withdrawals))
        .layer(from_fn_with_state(state.clone(), require_auth));

    let public = Router::new()
        .route("/api/user/register", post(handlers::register))
        .route("/api/user/login", post(handlers::login));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(from_fn(logging))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
