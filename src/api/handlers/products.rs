//! Loans, cards and investments.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bankd_core::CardStatus;
use uuid::Uuid;

use super::body;
use crate::{
    api::{
        created,
        dto::{InvestRequest, IssueCardRequest, LoanApplication, RepayRequest},
        error::ApiError,
        idempotency_key, idempotent_response, ok, AppState,
    },
    auth::CallerIdentity,
};

pub async fn list_loans(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_loans(&caller)?))
}

pub async fn apply_for_loan(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<LoanApplication>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let loan = state.bank.apply_for_loan(
        &caller,
        request.account_id,
        request.principal,
        request.term_months,
        &request.purpose,
    )?;
    Ok(created(loan))
}

pub async fn repay_loan(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<RepayRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let loan = state
        .bank
        .repay_loan(&caller, id, request.account_id, request.amount, key.as_deref())?;
    Ok(idempotent_response(StatusCode::OK, loan))
}

pub async fn list_cards(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_cards(&caller)?))
}

/// The full card number appears only in this response.
pub async fn issue_card(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<IssueCardRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    Ok(created(state.bank.issue_card(&caller, request.account_id, request.kind)?))
}

pub async fn block_card(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.set_card_status(&caller, id, CardStatus::Blocked)?))
}

pub async fn unblock_card(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.set_card_status(&caller, id, CardStatus::Active)?))
}

pub async fn list_investments(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_investments(&caller)?))
}

pub async fn invest(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<InvestRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let investment = state.bank.invest(
        &caller,
        request.account_id,
        &request.product,
        request.amount,
        key.as_deref(),
    )?;
    Ok(idempotent_response(StatusCode::CREATED, investment))
}
