use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use uuid::Uuid;

use super::body;
use crate::{
    api::{dto::PaymentRequest, error::ApiError, idempotency_key, idempotent_response, ok, AppState},
    auth::CallerIdentity,
};

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_payments(&caller)?))
}

/// Accepts the payment as `processing`; settlement follows asynchronously.
pub async fn create(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let payment = state.bank.create_payment(
        &caller,
        request.account_id,
        &request.payee,
        request.amount,
        key.as_deref(),
    )?;
    Ok(idempotent_response(StatusCode::ACCEPTED, payment))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.get_payment(&caller, id)?))
}
