//! HTTP surface. Handlers validate the request shape, call a [`Bank`]
//! service and wrap the result in an [`Envelope`].

use std::sync::Arc;

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;

use crate::{auth, bank::Bank, bank::Idempotent, config::ApiKeyEntry, telemetry};

pub mod dto;
pub mod error;
pub mod handlers;
pub mod stream;

use error::ApiError;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAYED: &str = "idempotent-replayed";
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Clone)]
pub struct AppState {
    pub bank: Bank,
    pub api_keys: Arc<Vec<ApiKeyEntry>>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(bank: Bank, api_keys: Vec<ApiKeyEntry>, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            bank,
            api_keys: Arc::new(api_keys),
            metrics,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(data: T) -> Self {
        Self { success: true, data }
    }
}

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope::new(data))
}

pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<Envelope<T>>) {
    (StatusCode::CREATED, Json(Envelope::new(data)))
}

/// Replays carry the `Idempotent-Replayed: true` header.
pub fn idempotent_response<T: Serialize>(status: StatusCode, result: Idempotent<T>) -> Response {
    let mut response = (status, Json(Envelope::new(result.value))).into_response();
    if result.replayed {
        response
            .headers_mut()
            .insert(IDEMPOTENT_REPLAYED, HeaderValue::from_static("true"));
    }
    response
}

pub fn idempotency_key(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(value) = headers.get(IDEMPOTENCY_KEY) else {
        return Ok(None);
    };
    let key = value
        .to_str()
        .map_err(|_| ApiError::bad_request("Idempotency-Key must be visible ASCII"))?
        .trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ApiError::bad_request(format!(
            "Idempotency-Key must be 1 to {} characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(Some(key.to_string()))
}

pub fn session_cookie(token: &str, ttl: time::Duration) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        auth::SESSION_COOKIE,
        token,
        ttl.whole_seconds().max(0)
    )
}

pub fn cleared_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", auth::SESSION_COOKIE)
}

pub fn text_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    use handlers::{accounts, admin, identity, ledger, budget, payments, products, system};

    let protected = Router::new()
        .route("/api/logout", post(identity::logout))
        .route("/api/me", get(identity::me))
        .route("/api/balance", get(accounts::balance))
        .route("/api/accounts", get(accounts::list).post(accounts::open))
        .route("/api/accounts/:id", get(accounts::get_one))
        .route("/api/accounts/:id/statement", get(accounts::statement))
        .route("/api/deposit", post(ledger::deposit))
        .route("/api/withdraw", post(ledger::withdraw))
        .route("/api/transfer", post(ledger::transfer))
        .route("/api/transfers", get(ledger::list_transfers))
        .route(
            "/api/transactions",
            get(ledger::list_transactions).post(ledger::create_transaction),
        )
        .route("/api/loans", get(products::list_loans).post(products::apply_for_loan))
        .route("/api/loans/:id/repay", post(products::repay_loan))
        .route("/api/cards", get(products::list_cards).post(products::issue_card))
        .route("/api/cards/:id/block", post(products::block_card))
        .route("/api/cards/:id/unblock", post(products::unblock_card))
        .route("/api/investments", get(products::list_investments).post(products::invest))
        .route("/api/payments", get(payments::list).post(payments::create))
        .route("/api/payments/events", get(stream::payment_events))
        .route("/api/payments/:id", get(payments::get_one))
        .route("/api/expenditures", get(budget::list_expenditures).post(budget::record_expenditure))
        .route("/api/analytics", get(budget::analytics))
        .route("/api/admin/overview", get(admin::overview))
        .route("/api/admin/users", get(admin::users))
        .route("/api/admin/accounts", get(admin::accounts))
        .route("/api/admin/accounts/:id/status", post(admin::set_account_status))
        .route("/api/admin/loans", get(admin::loans))
        .route("/api/admin/loans/:id/approve", post(admin::approve_loan))
        .route("/api/admin/loans/:id/reject", post(admin::reject_loan))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    let public = Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .route("/api/register", post(identity::register))
        .route("/api/login", post(identity::login))
        .route("/api/otp/request", post(identity::request_otp))
        .route("/api/otp/verify", post(identity::verify_otp));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback(system::not_found)
        .layer(middleware::from_fn(telemetry::track_requests))
        .with_state(state)
}
