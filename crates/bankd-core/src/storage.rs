use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::{
    ledger::{IdempotencyRecord, LedgerEntry, Page, Posting, Transfer},
    products::{Card, CardStatus, Expenditure, Investment, Loan, Payment, PaymentStatus},
    Account, AccountStatus, OtpChallenge, Session, User,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("insufficient funds in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: Uuid,
        balance: Decimal,
        requested: Decimal,
    },
    #[error("account {0} is not active")]
    AccountInactive(Uuid),
    #[error("idempotency key {0} was already used for a different request")]
    IdempotencyConflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage is busy: {0}")]
    Busy(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound { entity, id: id.to_string() }
    }

    /// Transient failures that a client may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

/// Handle passed to a unit of work. Everything written through it commits
/// together or not at all.
pub trait StoreTx {
    fn account(&mut self, id: Uuid) -> Result<Account, StorageError>;

    /// Applies a signed posting to its account and appends the ledger row.
    ///
    /// Fails with `AccountInactive` unless the account is active and with
    /// `InsufficientFunds` when the resulting balance would be negative.
    fn post(&mut self, posting: &Posting) -> Result<LedgerEntry, StorageError>;

    fn insert_transfer(&mut self, transfer: &Transfer) -> Result<(), StorageError>;
    fn loan(&mut self, id: Uuid) -> Result<Loan, StorageError>;
    fn save_loan(&mut self, loan: &Loan) -> Result<(), StorageError>;
    fn insert_investment(&mut self, investment: &Investment) -> Result<(), StorageError>;
    fn payment(&mut self, id: Uuid) -> Result<Payment, StorageError>;
    fn save_payment(&mut self, payment: &Payment) -> Result<(), StorageError>;

    fn idempotency_record(&mut self, user_id: Uuid, key: &str) -> Result<Option<IdempotencyRecord>, StorageError>;
    fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError>;
}

pub type UnitOfWork<'a> = dyn FnMut(&mut dyn StoreTx) -> Result<(), StorageError> + 'a;

pub trait StorageBackend: Send + Sync {
    // Users and sessions
    fn create_user(&self, user: &User) -> Result<(), StorageError>;
    fn get_user(&self, id: Uuid) -> Result<User, StorageError>;
    /// Looks a user up by email (case-insensitive) or username.
    fn find_user_by_login(&self, login: &str) -> Result<Option<User>, StorageError>;
    fn list_users(&self) -> Result<Vec<User>, StorageError>;
    /// Removes a user with their sessions and any account that has no
    /// ledger entries. Undoes a registration that did not complete.
    fn delete_user(&self, id: Uuid) -> Result<(), StorageError>;

    fn create_session(&self, session: &Session) -> Result<(), StorageError>;
    fn get_session(&self, token: &str) -> Result<Option<Session>, StorageError>;
    fn delete_session(&self, token: &str) -> Result<(), StorageError>;
    fn delete_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError>;

    fn save_otp(&self, challenge: &OtpChallenge) -> Result<(), StorageError>;
    /// Removes and returns the pending challenge for `email`.
    fn take_otp(&self, email: &str) -> Result<Option<OtpChallenge>, StorageError>;

    // Accounts and ledger reads
    fn create_account(&self, account: &Account) -> Result<(), StorageError>;
    fn get_account(&self, id: Uuid) -> Result<Account, StorageError>;
    fn find_account_by_number(&self, account_number: &str) -> Result<Option<Account>, StorageError>;
    /// Accounts of one user, or all accounts when `user_id` is `None`.
    fn list_accounts(&self, user_id: Option<Uuid>) -> Result<Vec<Account>, StorageError>;
    fn set_account_status(&self, id: Uuid, status: AccountStatus) -> Result<Account, StorageError>;

    /// Ledger entries of an account, most recent first.
    fn list_entries(&self, account_id: Uuid, page: Page) -> Result<Vec<LedgerEntry>, StorageError>;
    /// Transfers touching any of the given accounts, most recent first.
    fn list_transfers(&self, account_ids: &[Uuid], page: Page) -> Result<Vec<Transfer>, StorageError>;

    // Products
    fn create_card(&self, card: &Card) -> Result<(), StorageError>;
    fn get_card(&self, id: Uuid) -> Result<Card, StorageError>;
    fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StorageError>;
    fn set_card_status(&self, id: Uuid, status: CardStatus) -> Result<Card, StorageError>;

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError>;
    fn get_loan(&self, id: Uuid) -> Result<Loan, StorageError>;
    fn list_loans(&self, user_id: Option<Uuid>) -> Result<Vec<Loan>, StorageError>;

    fn list_investments(&self, user_id: Uuid) -> Result<Vec<Investment>, StorageError>;

    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError>;
    fn get_payment(&self, id: Uuid) -> Result<Payment, StorageError>;
    fn list_payments(&self, user_id: Uuid) -> Result<Vec<Payment>, StorageError>;
    /// Payments of every user in `status`, oldest first.
    fn list_payments_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>, StorageError>;

    fn create_expenditure(&self, expenditure: &Expenditure) -> Result<(), StorageError>;
    fn list_expenditures(&self, user_id: Uuid) -> Result<Vec<Expenditure>, StorageError>;

    /// Runs `work` as one serialized unit. Any error discards every write it made.
    fn atomically(&self, work: &mut UnitOfWork<'_>) -> Result<(), StorageError>;
}
