use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use super::body;
use crate::{
    api::{dto::AccountStatusRequest, error::ApiError, ok, AppState},
    auth::CallerIdentity,
};

pub async fn overview(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.admin_overview(&caller)?))
}

pub async fn users(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.admin_users(&caller)?))
}

pub async fn accounts(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.admin_accounts(&caller)?))
}

pub async fn set_account_status(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<AccountStatusRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    let request = body(payload)?;
    Ok(ok(state.bank.set_account_status(&caller, id, request.status)?))
}

pub async fn loans(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.admin_loans(&caller)?))
}

pub async fn approve_loan(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.approve_loan(&caller, id)?))
}

pub async fn reject_loan(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.reject_loan(&caller, id)?))
}
