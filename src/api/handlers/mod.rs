//! Route handlers, one module per resource family.

use axum::{extract::rejection::JsonRejection, Json};

use super::error::ApiError;

pub mod accounts;
pub mod admin;
pub mod budget;
pub mod identity;
pub mod ledger;
pub mod payments;
pub mod products;
pub mod system;

/// Unwraps a JSON body, turning extractor rejections into validation errors.
pub(crate) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    let Json(value) = payload?;
    Ok(value)
}
