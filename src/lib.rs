//! bankd: retail banking API server.

pub mod api;
pub mod auth;
pub mod bank;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod password;
pub mod telemetry;
pub mod validation;

pub use api::{router, AppState};
pub use bank::{Bank, Settings};
pub use error::BankError;
