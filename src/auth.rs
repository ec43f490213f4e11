use axum::{
    extract::State,
    http::{header, HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bankd_core::Role;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{
    api::{error::ApiError, AppState},
    error::BankError,
};

pub const SESSION_COOKIE: &str = "bankd_session";

/// Authenticated caller identity, available to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    /// `None` for service API keys.
    pub user_id: Option<Uuid>,
    pub name: String,
    pub role: Role,
    pub session_token: Option<String>,
}

impl CallerIdentity {
    pub fn service(name: &str) -> Self {
        Self {
            user_id: None,
            name: name.to_string(),
            role: Role::Admin,
            session_token: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), BankError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(BankError::Forbidden("admin role required".to_string()))
        }
    }

    /// The user this caller acts as. Service keys have none.
    pub fn require_user(&self) -> Result<Uuid, BankError> {
        self.user_id
            .ok_or_else(|| BankError::Forbidden("service keys cannot act as a customer".to_string()))
    }

    /// Scope for idempotency keys. Service keys share the nil scope.
    pub fn scope(&self) -> Uuid {
        self.user_id.unwrap_or_else(Uuid::nil)
    }

    pub fn can_access(&self, owner: Uuid) -> bool {
        self.is_admin() || self.user_id == Some(owner)
    }
}

/// Session token from `Authorization: Bearer`, falling back to the session cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find(|token| !token.is_empty())
        .map(str::to_string)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<CallerIdentity, BankError> {
    if let Some(key) = headers.get("X-API-Key").and_then(|v| v.to_str().ok()) {
        return match state
            .api_keys
            .iter()
            .find(|entry| entry.key.as_bytes().ct_eq(key.as_bytes()).into())
        {
            Some(entry) => {
                tracing::debug!(caller = %entry.name, "Authenticated service key");
                Ok(CallerIdentity::service(&entry.name))
            }
            None => {
                tracing::warn!("Invalid API key presented");
                Err(BankError::Unauthorized("invalid API key".to_string()))
            }
        };
    }

    let token = session_token(headers).ok_or_else(|| {
        BankError::Unauthorized(
            "missing credentials. Provide Authorization: Bearer <token>, the session cookie or X-API-Key".to_string(),
        )
    })?;
    let (user, session) = state.bank.resolve_session(&token)?;
    tracing::debug!(user_id = %user.id, role = %user.role, "Authenticated session");
    Ok(CallerIdentity {
        user_id: Some(user.id),
        name: user.username,
        role: user.role,
        session_token: Some(session.token),
    })
}

pub async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Response {
    match authenticate(&state, req.headers()) {
        Ok(caller) => {
            req.extensions_mut().insert(caller);
            next.run(req).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
