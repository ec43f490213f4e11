use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};

use super::body;
use crate::{
    api::{
        dto::{AmountRequest, CashKind, PageQuery, TransactionRequest, TransactionsQuery, TransferRequest},
        error::ApiError,
        idempotency_key, idempotent_response, ok, AppState,
    },
    auth::CallerIdentity,
};

pub async fn deposit(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let entry = state.bank.deposit(
        &caller,
        request.account_id,
        request.amount,
        request.description.as_deref(),
        key.as_deref(),
    )?;
    Ok(idempotent_response(StatusCode::CREATED, entry))
}

pub async fn withdraw(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<AmountRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let entry = state.bank.withdraw(
        &caller,
        request.account_id,
        request.amount,
        request.description.as_deref(),
        key.as_deref(),
    )?;
    Ok(idempotent_response(StatusCode::CREATED, entry))
}

pub async fn transfer(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<TransferRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let receipt = state.bank.transfer(
        &caller,
        request.from_account_id,
        &request.to_account_number,
        request.amount,
        request.description.as_deref(),
        key.as_deref(),
    )?;
    Ok(idempotent_response(StatusCode::CREATED, receipt))
}

/// Generic cash entry: `{"type": "deposit" | "withdrawal", ...}`.
pub async fn create_transaction(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Result<Json<TransactionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let key = idempotency_key(&headers)?;
    let request = body(payload)?;
    let description = request.description.as_deref();
    let entry = match request.kind {
        CashKind::Deposit => {
            state
                .bank
                .deposit(&caller, request.account_id, request.amount, description, key.as_deref())?
        }
        CashKind::Withdrawal => {
            state
                .bank
                .withdraw(&caller, request.account_id, request.amount, description, key.as_deref())?
        }
    };
    Ok(idempotent_response(StatusCode::CREATED, entry))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<TransactionsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    Ok(ok(state.bank.list_transactions(&caller, query.account_id, query.page())?))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<PageQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    Ok(ok(state.bank.list_transfers(&caller, query.page())?))
}
