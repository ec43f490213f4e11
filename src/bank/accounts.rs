use bankd_core::{Account, AccountKind, AccountStatement, AccountStatus, Page, StorageError};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::Bank;
use crate::{auth::CallerIdentity, error::BankError};

const ACCOUNT_NUMBER_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountBalance {
    pub id: Uuid,
    pub account_number: String,
    pub kind: AccountKind,
    pub status: AccountStatus,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSummary {
    pub total: Decimal,
    pub accounts: Vec<AccountBalance>,
}

fn generate_account_number() -> String {
    let mut rng = rand::thread_rng();
    // no leading zero
    let first = rng.gen_range(1..=9u8);
    let rest: String = (0..11).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
    format!("{}{}", first, rest)
}

impl Bank {
    pub fn open_account(&self, caller: &CallerIdentity, kind: AccountKind) -> Result<Account, BankError> {
        let user_id = caller.require_user()?;
        self.open_account_for(user_id, kind)
    }

    pub(crate) fn open_account_for(&self, user_id: Uuid, kind: AccountKind) -> Result<Account, BankError> {
        for _ in 0..ACCOUNT_NUMBER_ATTEMPTS {
            let account = Account::open(user_id, generate_account_number(), kind);
            match self.storage.create_account(&account) {
                Ok(()) => {
                    tracing::info!(user_id = %user_id, account_id = %account.id, kind = %kind, "Account opened");
                    return Ok(account);
                }
                Err(StorageError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(BankError::Internal("could not allocate a unique account number".to_string()))
    }

    pub fn list_accounts(&self, caller: &CallerIdentity) -> Result<Vec<Account>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_accounts(Some(user_id))?)
    }

    pub fn get_account(&self, caller: &CallerIdentity, account_id: Uuid) -> Result<Account, BankError> {
        self.accessible_account(caller, account_id)
    }

    pub fn balance_summary(&self, caller: &CallerIdentity) -> Result<BalanceSummary, BankError> {
        let accounts = self.list_accounts(caller)?;
        let total = accounts.iter().map(|a| a.balance).sum();
        Ok(BalanceSummary {
            total,
            accounts: accounts
                .into_iter()
                .map(|a| AccountBalance {
                    id: a.id,
                    account_number: a.account_number,
                    kind: a.kind,
                    status: a.status,
                    balance: a.balance,
                })
                .collect(),
        })
    }

    /// Statement over the requested page of entries, oldest first.
    pub fn statement(&self, caller: &CallerIdentity, account_id: Uuid, page: Page) -> Result<AccountStatement, BankError> {
        let account = self.accessible_account(caller, account_id)?;
        let mut entries = self.storage.list_entries(account_id, page)?;
        entries.reverse();
        Ok(AccountStatement::from_entries(account, entries))
    }
}
