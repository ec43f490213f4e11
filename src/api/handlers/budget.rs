//! Expenditure tracking and cash-flow analytics.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    response::IntoResponse,
    Extension, Json,
};

use super::body;
use crate::{
    api::{
        created,
        dto::{AnalyticsQuery, ExpenditureRequest},
        error::ApiError,
        ok, AppState,
    },
    auth::CallerIdentity,
};

pub async fn list_expenditures(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.bank.list_expenditures(&caller)?))
}

pub async fn record_expenditure(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    payload: Result<Json<ExpenditureRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    let expenditure = state.bank.record_expenditure(
        &caller,
        &request.category,
        request.amount,
        request.note.as_deref(),
        request.spent_on,
    )?;
    Ok(created(expenditure))
}

pub async fn analytics(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    Ok(ok(state.bank.analytics(&caller, query.months)?))
}
