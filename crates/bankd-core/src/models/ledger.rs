use std::fmt::Display;

use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{string_enum, Account, ParseEnumError};

string_enum!(TransactionKind, "transaction kind" {
    Deposit => "DEPOSIT",
    Withdrawal => "WITHDRAWAL",
    TransferIn => "TRANSFER_IN",
    TransferOut => "TRANSFER_OUT",
    LoanDisbursement => "LOAN_DISBURSEMENT",
    LoanRepayment => "LOAN_REPAYMENT",
    Payment => "PAYMENT",
    Investment => "INVESTMENT",
});

/// A single balance change requested inside a unit of work.
///
/// `amount` is signed: positive credits the account, negative debits it.
#[derive(Debug, Clone, PartialEq)]
pub struct Posting {
    pub account_id: Uuid,
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub description: String,
    pub reference: Option<Uuid>,
}

impl Posting {
    pub fn credit(account_id: Uuid, amount: Decimal, kind: TransactionKind, description: impl Into<String>) -> Self {
        Self {
            account_id,
            amount: amount.abs(),
            kind,
            description: description.into(),
            reference: None,
        }
    }

    pub fn debit(account_id: Uuid, amount: Decimal, kind: TransactionKind, description: impl Into<String>) -> Self {
        Self {
            account_id,
            amount: -amount.abs(),
            kind,
            description: description.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: Uuid) -> Self {
        self.reference = Some(reference);
        self
    }
}

/// Append-only ledger row. `balance_after` is the account balance once this
/// entry is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub description: String,
    pub reference: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub from_account: Uuid,
    pub to_account: Uuid,
    pub amount: Decimal,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Stored response of an idempotent request, scoped to the user that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord {
    pub user_id: Uuid,
    pub key: String,
    pub fingerprint: String,
    pub response: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 500;

    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    pub fn all() -> Self {
        Self { limit: usize::MAX, offset: 0 }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountStatement {
    pub account: Account,
    pub opening_balance: Decimal,
    pub closing_balance: Decimal,
    pub entries: Vec<LedgerEntry>,
}

impl AccountStatement {
    /// Builds a statement from entries in ledger order.
    pub fn from_entries(account: Account, entries: Vec<LedgerEntry>) -> Self {
        let opening_balance = entries
            .first()
            .map(|e| e.balance_after - e.amount)
            .unwrap_or(account.balance);
        let closing_balance = entries.last().map(|e| e.balance_after).unwrap_or(account.balance);
        Self {
            account,
            opening_balance,
            closing_balance,
            entries,
        }
    }
}

impl Display for AccountStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table.add_row(row!["Date", "Type", "Description", "Amount", "Balance"]);
        table.add_empty_row();
        table.add_row(row!["", "", "Opening balance", "", self.opening_balance]);

        for entry in &self.entries {
            let date = entry.created_at.date();
            table.add_row(row![date, entry.kind, entry.description, entry.amount, entry.balance_after]);
        }

        table.add_row(row!["", "", "Closing balance", "", self.closing_balance]);

        writeln!(f, "Account {} ({})", self.account.account_number, self.account.kind)?;
        write!(f, "{}", table)
    }
}
