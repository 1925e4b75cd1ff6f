//! HTTP handlers for the `/api/user` surface.
//!
//! Each function is a plain async fn taking extractors and returning a
//! `Response`, translating Store/Auth outcomes into status codes rather
//! than leaking internal error types to the client.

use axum::extract::{Extension, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use model::{
    luhn_valid, AddOrderOutcome, Credentials, OrderView, WithdrawRequest, WithdrawalView,
};
use repository::RepositoryError;

use crate::error::ApiError;
use crate::middleware::AuthenticatedUser;
use crate::state::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Response, ApiError> {
    if body.login.is_empty() || body.password.is_empty() {
        return Err(ApiError::BadRequest("login and password are required".to_string()));
    }
    let token = state.auth.register(&body.login, &body.password).await?;
    Ok(bearer_response(&token))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<Response, ApiError> {
    if body.login.is_empty() || body.password.is_empty() {
        return Err(ApiError::BadRequest("login and password are required".to_string()));
    }
    let token = state.auth.login(&body.login, &body.password).await?;
    Ok(bearer_response(&token))
}

fn bearer_response(token: &str) -> Response {
    (
        StatusCode::OK,
        [(header::AUTHORIZATION, format!("Bearer {token}"))],
    )
        .into_response()
}

pub async fn submit_order(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    body: String,
) -> Result<Response, ApiError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ApiError::BadRequest("order number is required".to_string()));
    }
    let order_id: i64 = body
        .parse()
        .map_err(|_| ApiError::BadRequest("order number must be numeric".to_string()))?;

    if !luhn_valid(order_id) {
        return Err(ApiError::UnprocessableEntity(
            "order number fails the Luhn check".to_string(),
        ));
    }

    let outcome = state.store.add_order(order_id, user_id).await?;
    match outcome {
        AddOrderOutcome::Inserted => {
            let _ = state.poller_tx.send(order_id);
            Ok(StatusCode::ACCEPTED.into_response())
        }
        AddOrderOutcome::AlreadyYours(status) => {
            if !status.is_terminal() {
                let _ = state.poller_tx.send(order_id);
            }
            Ok(StatusCode::OK.into_response())
        }
        AddOrderOutcome::OwnedByOther => {
            Err(ApiError::Conflict("order already submitted by another user".to_string()))
        }
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> Result<Response, ApiError> {
    let orders = state.store.list_orders(user_id).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let views: Vec<OrderView> = orders.into_iter().map(OrderView::from).collect();
    Ok(Json(views).into_response())
}

pub async fn get_balance(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> Result<Response, ApiError> {
    let balance = state.store.get_balance(user_id).await?;
    Ok(Json(balance).into_response())
}

pub async fn withdraw(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Json(body): Json<WithdrawRequest>,
) -> Result<Response, ApiError> {
    if body.order.is_empty() {
        return Err(ApiError::UnprocessableEntity("order number is required".to_string()));
    }
    let sum = body
        .sum
        .ok_or_else(|| ApiError::BadRequest("sum is required".to_string()))?;
    if sum <= 0.0 {
        return Err(ApiError::BadRequest("sum must be positive".to_string()));
    }
    let order_id: i64 = body
        .order
        .parse()
        .map_err(|_| ApiError::UnprocessableEntity("order number must be numeric".to_string()))?;
    if !luhn_valid(order_id) {
        return Err(ApiError::UnprocessableEntity(
            "order number fails the Luhn check".to_string(),
        ));
    }

    match state.store.spend_bonus(user_id, order_id, sum).await {
        Ok(()) => Ok(StatusCode::OK.into_response()),
        Err(RepositoryError::InsufficientFunds) => Err(ApiError::PaymentRequired),
        Err(e) => Err(e.into()),
    }
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
) -> Result<Response, ApiError> {
    let payments = state.store.spent_bonus_list(user_id).await?;
    if payments.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }
    let views: Vec<WithdrawalView> = payments.into_iter().map(WithdrawalView::from).collect();
    Ok(Json(views).into_response())
}
