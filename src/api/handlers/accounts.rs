use axum::{
    body::Bytes,
    extract::{
        rejection::{PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Extension,
};
use bankd_core::{AccountKind, Page};
use uuid::Uuid;

use crate::{
    api::{
        created,
        dto::{OpenAccountRequest, StatementFormat, StatementQuery},
        error::ApiError,
        ok, text_response, AppState,
    },
    auth::CallerIdentity,
};

pub async fn balance(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.balance_summary(&caller)?))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_accounts(&caller)?))
}

/// An empty body opens a checking account. Anything else must be a JSON
/// object naming a known kind.
pub async fn open(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    headers: HeaderMap,
    payload: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let kind = open_account_kind(&headers, &payload)?;
    Ok(created(state.bank.open_account(&caller, kind)?))
}

fn open_account_kind(headers: &HeaderMap, payload: &[u8]) -> Result<AccountKind, ApiError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(AccountKind::Checking);
    }
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| {
            let mime = mime.trim().to_ascii_lowercase();
            mime == "application/json" || mime.ends_with("+json")
        })
        .unwrap_or(false);
    if !is_json {
        return Err(ApiError::bad_request("Expected request with `Content-Type: application/json`"));
    }
    let request: OpenAccountRequest = serde_json::from_slice(payload)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse the request body as JSON: {}", e)))?;
    Ok(request.kind.unwrap_or(AccountKind::Checking))
}

pub async fn get_one(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Path(id) = id?;
    Ok(ok(state.bank.get_account(&caller, id)?))
}

pub async fn statement(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<StatementQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = id?;
    let Query(query) = query?;
    let statement = state
        .bank
        .statement(&caller, id, Page::new(query.limit, query.offset))?;
    Ok(match query.format {
        StatementFormat::Json => ok(statement).into_response(),
        StatementFormat::Text => text_response(statement.to_string()),
    })
}
