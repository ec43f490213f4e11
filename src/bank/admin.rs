use bankd_core::{Account, AccountStatus, Loan, LoanStatus, User};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::Bank;
use crate::{auth::CallerIdentity, error::BankError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub users: usize,
    pub accounts: usize,
    pub active_accounts: usize,
    pub total_deposits: Decimal,
    pub pending_loans: usize,
    pub active_loans: usize,
    pub outstanding_loans: Decimal,
}

impl Bank {
    pub fn admin_overview(&self, caller: &CallerIdentity) -> Result<Overview, BankError> {
        caller.require_admin()?;
        let users = self.storage.list_users()?;
        let accounts = self.storage.list_accounts(None)?;
        let loans = self.storage.list_loans(None)?;

        let active: Vec<&Loan> = loans.iter().filter(|l| l.status == LoanStatus::Active).collect();
        Ok(Overview {
            users: users.len(),
            accounts: accounts.len(),
            active_accounts: accounts.iter().filter(|a| a.is_active()).count(),
            total_deposits: accounts.iter().map(|a| a.balance).sum(),
            pending_loans: loans.iter().filter(|l| l.status == LoanStatus::Pending).count(),
            active_loans: active.len(),
            outstanding_loans: active.iter().map(|l| l.outstanding).sum(),
        })
    }

    pub fn admin_users(&self, caller: &CallerIdentity) -> Result<Vec<User>, BankError> {
        caller.require_admin()?;
        Ok(self.storage.list_users()?)
    }

    pub fn admin_accounts(&self, caller: &CallerIdentity) -> Result<Vec<Account>, BankError> {
        caller.require_admin()?;
        Ok(self.storage.list_accounts(None)?)
    }

    pub fn admin_loans(&self, caller: &CallerIdentity) -> Result<Vec<Loan>, BankError> {
        caller.require_admin()?;
        Ok(self.storage.list_loans(None)?)
    }

    /// Frozen and closed accounts refuse every posting.
    pub fn set_account_status(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        status: AccountStatus,
    ) -> Result<Account, BankError> {
        caller.require_admin()?;
        let account = self.storage.set_account_status(account_id, status)?;
        tracing::info!(account_id = %account_id, status = %status, admin = %caller.name, "Account status set");
        Ok(account)
    }
}
