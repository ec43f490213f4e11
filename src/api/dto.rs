//! Request bodies and query strings.

use bankd_core::{AccountKind, AccountStatus, CardKind, Page};
use rust_decimal::Decimal;
use serde::Deserialize;
use time::Date;
use uuid::Uuid;

use crate::bank::NewUser;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub password: String,
    #[serde(default)]
    pub phone: Option<String>,
}

impl From<RegisterRequest> for NewUser {
    fn from(r: RegisterRequest) -> Self {
        NewUser {
            email: r.email,
            username: r.username,
            full_name: r.full_name,
            password: r.password,
            phone: r.phone,
        }
    }
}

/// `login` accepts an email address or a username.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "email", alias = "username")]
    pub login: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenAccountRequest {
    #[serde(default)]
    pub kind: Option<AccountKind>,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub account_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from_account_id: Uuid,
    pub to_account_number: String,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CashKind {
    Deposit,
    Withdrawal,
}

/// Body of `POST /api/transactions`.
#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    #[serde(rename = "type")]
    pub kind: CashKind,
    pub account_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TransactionsQuery {
    pub account_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TransactionsQuery {
    pub fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatementQuery {
    #[serde(default)]
    pub format: StatementFormat,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LoanApplication {
    pub account_id: Uuid,
    pub principal: Decimal,
    pub term_months: u32,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Debug, Deserialize)]
pub struct RepayRequest {
    pub account_id: Uuid,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct IssueCardRequest {
    pub account_id: Uuid,
    pub kind: CardKind,
}

#[derive(Debug, Deserialize)]
pub struct InvestRequest {
    pub account_id: Uuid,
    pub product: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub account_id: Uuid,
    pub payee: String,
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ExpenditureRequest {
    pub category: String,
    pub amount: Decimal,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub spent_on: Option<Date>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub months: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AccountStatusRequest {
    pub status: AccountStatus,
}
