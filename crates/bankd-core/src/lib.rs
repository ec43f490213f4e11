//! Core types and traits for bankd storage backends.
//!
//! This crate provides the `StorageBackend` trait, the `StoreTx` unit-of-work
//! handle and the domain models shared by every backend, enabling pluggable
//! storage implementations in separate crates.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    Account, AccountKind, AccountStatus, OtpChallenge, ParseEnumError, Role, Session, User,
};
pub use models::ledger::{
    AccountStatement, IdempotencyRecord, LedgerEntry, Page, Posting, TransactionKind, Transfer,
};
pub use models::products::{
    luhn_check_digit, mask_card_number, Card, CardKind, CardStatus, Expenditure, Investment, Loan,
    LoanStatus, Payment, PaymentStatus,
};
pub use storage::{StorageBackend, StorageError, StoreTx, UnitOfWork};
