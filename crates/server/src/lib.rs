//! HTTP server for the loyalty-accrual backend.
//!
//! A `Server` struct owns bind/serve/graceful-shutdown; routing, handlers,
//! and the auth gate live in their own modules (`router`, `handlers`,
//! `middleware`).

mod error;
mod handlers;
mod middleware;
mod router;
mod state;

pub use state::AppState;

use std::future::Future;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

/// HTTP server for the loyalty-accrual API.
pub struct Server {
    state: AppState,
    run_address: String,
}

impl Server {
    pub fn new(state: AppState, run_address: impl Into<String>) -> Self {
        Self {
            state,
            run_address: run_address.into(),
        }
    }

    /// Binds and serves until `shutdown` resolves, draining in-flight
    /// requests first.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let app = router::build(self.state);

        let listener = TcpListener::bind(&self.run_address)
            .await
            .context("failed to bind HTTP listener")?;
        info!(address = %self.run_address, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM; used as the default shutdown future.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use auth::AuthService;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use repository::fake::FakeStore;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Drain the backlog so the sender never blocks; tests don't assert
        // on poller delivery directly.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let store: Arc<dyn repository::Store> = Arc::new(FakeStore::new());
        AppState {
            store: store.clone(),
            auth: Arc::new(AuthService::new(store, "test-secret")),
            poller_tx: tx,
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_then_protected_route_with_token() {
        let state = test_state();
        let app = router::build(state);

        let register = Request::builder()
            .method("POST")
            .uri("/api/user/register")
            .header("content-type", "application/json")
            .body(Body::from(json!({"login": "alice", "password": "hunter2"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(register).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = response
            .headers()
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .strip_prefix("Bearer ")
            .unwrap()
            .to_string();

        let balance = Request::builder()
            .method("GET")
            .uri("/api/user/balance")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(balance).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["current"], 0.0);
    }

    #[tokio::test]
    async fn protected_route_without_token_is_unauthorized() {
        let app = router::build(test_state());
        let request = Request::builder()
            .method("GET")
            .uri("/api/user/balance")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_order_with_empty_body_is_bad_request() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/orders")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_order_failing_luhn_is_unprocessable() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/orders")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from("12121"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn submit_valid_order_is_accepted_then_owned_by_other_is_conflict() {
        let state = test_state();
        let alice_token = state.auth.register("alice", "hunter2").await.unwrap();
        let bob_token = state.auth.register("bob", "hunter2").await.unwrap();
        let app = router::build(state);

        let submit = |token: String| {
            Request::builder()
                .method("POST")
                .uri("/api/user/orders")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::from("7992723465"))
                .unwrap()
        };

        let response = app.clone().oneshot(submit(alice_token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app.oneshot(submit(bob_token)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn withdraw_more_than_balance_is_payment_required() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/balance/withdraw")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"order": "2377225624", "sum": 500.0}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[tokio::test]
    async fn withdraw_missing_sum_is_bad_request() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/balance/withdraw")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"order": "2377225624"}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn withdraw_zero_sum_is_bad_request() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/balance/withdraw")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"order": "2377225624", "sum": 0.0}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn withdraw_empty_order_is_unprocessable() {
        let state = test_state();
        let token = state.auth.register("alice", "hunter2").await.unwrap();
        let app = router::build(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/user/balance/withdraw")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({"order": "", "sum": 10.0}).to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
