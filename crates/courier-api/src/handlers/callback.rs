//! Callback endpoints for the default tenant and per-account paths.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, instrument};

use crate::{error::CallbackError, processor::CallbackQuery, AppState};

/// `GET /callback`: URL verification for the default tenant.
#[instrument(name = "callback_verify", skip_all)]
pub async fn verify_default(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    verify(&state, None, &query)
}

/// `GET /callback/{account_id}`: URL verification for one account.
#[instrument(name = "callback_verify", skip_all, fields(account = %account_id))]
pub async fn verify_account(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    verify(&state, Some(&account_id), &query)
}

/// `POST /callback`: message callback for the default tenant.
#[instrument(name = "callback_receive", skip_all, fields(content_length = body.len()))]
pub async fn receive_default(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    receive(&state, None, &query, &body).await
}

/// `POST /callback/{account_id}`: message callback for one account.
#[instrument(name = "callback_receive", skip_all, fields(account = %account_id, content_length = body.len()))]
pub async fn receive_account(
    Path(account_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    receive(&state, Some(&account_id), &query, &body).await
}

/// Any other method on a callback path.
pub async fn method_not_allowed() -> Response {
    CallbackError::MethodNotAllowed.into_response()
}

fn verify(state: &AppState, account_id: Option<&str>, query: &CallbackQuery) -> Response {
    match state.processor.verify_url(account_id, query) {
        Ok(echo) => {
            debug!("url verification succeeded");
            (StatusCode::OK, echo).into_response()
        },
        Err(error) => error.into_response(),
    }
}

async fn receive(state: &AppState, account_id: Option<&str>, query: &CallbackQuery, body: &[u8]) -> Response {
    match state.processor.handle_message(account_id, query, body).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(error) => error.into_response(),
    }
}
