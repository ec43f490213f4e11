use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bankd_core::{Role, User};
use serde::Serialize;
use serde_json::json;

use super::body;
use crate::{
    api::{
        cleared_session_cookie,
        dto::{LoginRequest, OtpRequest, OtpVerifyRequest, RegisterRequest},
        error::ApiError,
        ok, session_cookie, AppState, Envelope,
    },
    auth::CallerIdentity,
};

#[derive(Serialize)]
struct Me {
    name: String,
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<User>,
}

fn with_session<T: Serialize>(state: &AppState, status: StatusCode, token: &str, data: T) -> Response {
    let cookie = session_cookie(token, state.bank.settings().session_ttl);
    (status, [(header::SET_COOKIE, cookie)], Json(Envelope::new(data))).into_response()
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    let registration = state.bank.register(request.into()).await?;
    let token = registration.session.token.clone();
    Ok(with_session(&state, StatusCode::CREATED, &token, registration))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    let sign_in = state.bank.login(&request.login, &request.password).await?;
    let token = sign_in.session.token.clone();
    Ok(with_session(&state, StatusCode::OK, &token, sign_in))
}

pub async fn request_otp(
    State(state): State<AppState>,
    payload: Result<Json<OtpRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body(payload)?;
    Ok(ok(state.bank.request_otp(&request.email)?))
}

pub async fn verify_otp(
    State(state): State<AppState>,
    payload: Result<Json<OtpVerifyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = body(payload)?;
    let sign_in = state.bank.verify_otp(&request.email, &request.code)?;
    let token = sign_in.session.token.clone();
    Ok(with_session(&state, StatusCode::OK, &token, sign_in))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<Response, ApiError> {
    if let Some(token) = caller.session_token.as_deref() {
        state.bank.logout(token)?;
        tracing::info!(user = %caller.name, "Signed out");
    }
    Ok((
        [(header::SET_COOKIE, cleared_session_cookie())],
        ok(json!({ "logged_out": true })),
    )
        .into_response())
}

pub async fn me(
    State(state): State<AppState>,
    Extension(caller): Extension<CallerIdentity>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.bank.current_user(&caller)?;
    Ok(ok(Me {
        name: caller.name,
        role: caller.role,
        user,
    }))
}
