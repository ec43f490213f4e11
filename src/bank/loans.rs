use bankd_core::{Loan, LoanStatus, Posting, StorageError, StoreTx, TransactionKind};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{owned_in_tx, Bank, Idempotent};
use crate::{auth::CallerIdentity, error::BankError, telemetry, validation};

pub const MAX_TERM_MONTHS: u32 = 360;

impl Bank {
    pub fn apply_for_loan(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        principal: Decimal,
        term_months: u32,
        purpose: &str,
    ) -> Result<Loan, BankError> {
        caller.require_user()?;
        let principal = validation::amount(principal, self.settings.max_loan_principal)?;
        if !(1..=MAX_TERM_MONTHS).contains(&term_months) {
            return Err(BankError::validation(format!(
                "term_months must be between 1 and {}",
                MAX_TERM_MONTHS
            )));
        }
        let purpose = validation::required("purpose", purpose)?;
        let account = self.accessible_account(caller, account_id)?;

        let annual_rate = self.settings.loan_annual_rate;
        let (monthly_installment, outstanding) = Loan::amortized_installment(principal, annual_rate, term_months)
            .and_then(|installment| Some((installment, installment.checked_mul(Decimal::from(term_months))?)))
            .ok_or_else(|| {
                BankError::validation(format!(
                    "no installment exists for {} over {} months at an annual rate of {}",
                    principal, term_months, annual_rate
                ))
            })?;
        let loan = Loan {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            account_id: account.id,
            principal,
            annual_rate,
            term_months,
            monthly_installment,
            outstanding,
            purpose,
            status: LoanStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            decided_at: None,
        };
        self.storage.create_loan(&loan)?;
        tracing::info!(loan_id = %loan.id, user_id = %loan.user_id, principal = %principal, "Loan application received");
        Ok(loan)
    }

    pub fn list_loans(&self, caller: &CallerIdentity) -> Result<Vec<Loan>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_loans(Some(user_id))?)
    }

    /// Activates a pending loan and credits the principal in the same unit.
    pub fn approve_loan(&self, caller: &CallerIdentity, loan_id: Uuid) -> Result<Loan, BankError> {
        caller.require_admin()?;
        let mut approved = None;
        self.storage.atomically(&mut |tx: &mut dyn StoreTx| {
            let mut loan = pending_loan(tx, loan_id)?;
            tx.post(
                &Posting::credit(
                    loan.account_id,
                    loan.principal,
                    TransactionKind::LoanDisbursement,
                    format!("Loan disbursement: {}", loan.purpose),
                )
                .with_reference(loan.id),
            )?;
            loan.status = LoanStatus::Active;
            loan.decided_at = Some(OffsetDateTime::now_utc());
            tx.save_loan(&loan)?;
            approved = Some(loan);
            Ok(())
        })?;

        let loan = approved.ok_or_else(|| BankError::Internal("loan approval produced no result".to_string()))?;
        telemetry::record_posting(TransactionKind::LoanDisbursement);
        tracing::info!(loan_id = %loan.id, approver = %caller.name, "Loan approved and disbursed");
        Ok(loan)
    }

    pub fn reject_loan(&self, caller: &CallerIdentity, loan_id: Uuid) -> Result<Loan, BankError> {
        caller.require_admin()?;
        let mut rejected = None;
        self.storage.atomically(&mut |tx: &mut dyn StoreTx| {
            let mut loan = pending_loan(tx, loan_id)?;
            loan.status = LoanStatus::Rejected;
            loan.decided_at = Some(OffsetDateTime::now_utc());
            tx.save_loan(&loan)?;
            rejected = Some(loan);
            Ok(())
        })?;

        let loan = rejected.ok_or_else(|| BankError::Internal("loan rejection produced no result".to_string()))?;
        tracing::info!(loan_id = %loan.id, approver = %caller.name, "Loan rejected");
        Ok(loan)
    }

    /// Debits `account_id` and reduces the outstanding amount. A loan paid
    /// down to zero becomes `repaid`.
    pub fn repay_loan(
        &self,
        caller: &CallerIdentity,
        loan_id: Uuid,
        account_id: Uuid,
        amount: Decimal,
        key: Option<&str>,
    ) -> Result<Idempotent<Loan>, BankError> {
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let fingerprint = format!("repay:{}:{}:{}", loan_id, account_id, amount);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            let mut loan = tx.loan(loan_id)?;
            if !caller.can_access(loan.user_id) {
                return Err(StorageError::not_found("loan", loan_id));
            }
            if loan.status != LoanStatus::Active {
                return Err(StorageError::InvalidState(format!("loan {} is {}", loan.id, loan.status)));
            }
            if amount > loan.outstanding {
                return Err(StorageError::InvalidState(format!(
                    "repayment {} exceeds outstanding {}",
                    amount, loan.outstanding
                )));
            }
            owned_in_tx(tx, caller, account_id)?;
            tx.post(
                &Posting::debit(account_id, amount, TransactionKind::LoanRepayment, "Loan repayment")
                    .with_reference(loan.id),
            )?;
            loan.outstanding -= amount;
            if loan.outstanding.is_zero() {
                loan.status = LoanStatus::Repaid;
            }
            tx.save_loan(&loan)?;
            Ok(loan)
        })?;

        if result.replayed {
            telemetry::record_idempotent_replay("repay_loan");
        } else {
            telemetry::record_posting(TransactionKind::LoanRepayment);
            tracing::info!(loan_id = %loan_id, amount = %amount, status = %result.value.status, "Loan repayment posted");
        }
        Ok(result)
    }
}

fn pending_loan(tx: &mut dyn StoreTx, loan_id: Uuid) -> Result<Loan, StorageError> {
    let loan = tx.loan(loan_id)?;
    if loan.status != LoanStatus::Pending {
        return Err(StorageError::InvalidState(format!("loan {} is {}", loan.id, loan.status)));
    }
    Ok(loan)
}
