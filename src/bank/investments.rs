use bankd_core::{Investment, Posting, TransactionKind};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{owned_in_tx, Bank, Idempotent};
use crate::{auth::CallerIdentity, error::BankError, telemetry, validation};

impl Bank {
    /// Debits the funding account and records the investment in one unit.
    pub fn invest(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        product: &str,
        amount: Decimal,
        key: Option<&str>,
    ) -> Result<Idempotent<Investment>, BankError> {
        let user_id = caller.require_user()?;
        let product = validation::required("product", product)?;
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let fingerprint = format!("invest:{}:{}:{}", account_id, product, amount);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            owned_in_tx(tx, caller, account_id)?;
            let investment = Investment {
                id: Uuid::new_v4(),
                user_id,
                account_id,
                product: product.clone(),
                amount,
                created_at: OffsetDateTime::now_utc(),
            };
            tx.post(
                &Posting::debit(account_id, amount, TransactionKind::Investment, format!("Investment: {}", product))
                    .with_reference(investment.id),
            )?;
            tx.insert_investment(&investment)?;
            Ok(investment)
        })?;

        if result.replayed {
            telemetry::record_idempotent_replay("invest");
        } else {
            telemetry::record_posting(TransactionKind::Investment);
            tracing::info!(investment_id = %result.value.id, product = %result.value.product, amount = %amount, "Investment placed");
        }
        Ok(result)
    }

    pub fn list_investments(&self, caller: &CallerIdentity) -> Result<Vec<Investment>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_investments(user_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::testing::{bank, customer};
    use bankd_core::StorageError;
    use rust_decimal_macros::dec;

    #[test]
    fn test_investment_debits_funding_account() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 500);

        let investment = bank.invest(&alice, account.id, "Index fund", dec!(200), None).unwrap().value;
        assert_eq!(investment.amount, dec!(200));
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(300));
        assert_eq!(bank.list_investments(&alice).unwrap().len(), 1);
    }

    #[test]
    fn test_underfunded_investment_is_not_recorded() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 50);

        let err = bank.invest(&alice, account.id, "Bonds", dec!(51), None).unwrap_err();
        assert!(matches!(err, BankError::Storage(StorageError::InsufficientFunds { .. })));
        assert!(bank.list_investments(&alice).unwrap().is_empty());
    }
}
