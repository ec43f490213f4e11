use bankd_core::{LedgerEntry, Page, Posting, StorageError, TransactionKind, Transfer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{owned_in_tx, Bank, Idempotent};
use crate::{auth::CallerIdentity, error::BankError, telemetry, validation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transfer: Transfer,
    /// The debit leg on the source account.
    pub entry: LedgerEntry,
}

fn describe(description: Option<&str>, fallback: &str) -> Result<String, BankError> {
    let text = validation::optional_text("description", description)?;
    Ok(if text.is_empty() { fallback.to_string() } else { text })
}

impl Bank {
    pub fn deposit(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        amount: Decimal,
        description: Option<&str>,
        key: Option<&str>,
    ) -> Result<Idempotent<LedgerEntry>, BankError> {
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let description = describe(description, "Deposit")?;
        let fingerprint = format!("deposit:{}:{}:{}", account_id, amount, description);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            owned_in_tx(tx, caller, account_id)?;
            tx.post(&Posting::credit(account_id, amount, TransactionKind::Deposit, description.clone()))
        })?;
        self.observe(&result, "deposit", &[TransactionKind::Deposit]);
        if !result.replayed {
            tracing::info!(account_id = %account_id, amount = %amount, "Deposit posted");
        }
        Ok(result)
    }

    pub fn withdraw(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        amount: Decimal,
        description: Option<&str>,
        key: Option<&str>,
    ) -> Result<Idempotent<LedgerEntry>, BankError> {
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let description = describe(description, "Withdrawal")?;
        let fingerprint = format!("withdraw:{}:{}:{}", account_id, amount, description);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            owned_in_tx(tx, caller, account_id)?;
            tx.post(&Posting::debit(account_id, amount, TransactionKind::Withdrawal, description.clone()))
        })?;
        self.observe(&result, "withdraw", &[TransactionKind::Withdrawal]);
        if !result.replayed {
            tracing::info!(account_id = %account_id, amount = %amount, "Withdrawal posted");
        }
        Ok(result)
    }

    /// Moves funds to the account with number `to_account_number`, which may
    /// belong to another user. Both legs and the transfer record commit together.
    pub fn transfer(
        &self,
        caller: &CallerIdentity,
        from_account: Uuid,
        to_account_number: &str,
        amount: Decimal,
        description: Option<&str>,
        key: Option<&str>,
    ) -> Result<Idempotent<TransferReceipt>, BankError> {
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let description = describe(description, "Transfer")?;
        let to_account_number = to_account_number.trim();
        let destination = self
            .storage
            .find_account_by_number(to_account_number)?
            .ok_or_else(|| StorageError::not_found("account", to_account_number))?;
        if destination.id == from_account {
            return Err(BankError::validation("cannot transfer to the same account"));
        }
        let fingerprint = format!("transfer:{}:{}:{}:{}", from_account, destination.id, amount, description);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            let source = owned_in_tx(tx, caller, from_account)?;
            let transfer = Transfer {
                id: Uuid::new_v4(),
                from_account: source.id,
                to_account: destination.id,
                amount,
                description: description.clone(),
                created_at: OffsetDateTime::now_utc(),
            };
            let entry = tx.post(
                &Posting::debit(source.id, amount, TransactionKind::TransferOut, description.clone())
                    .with_reference(transfer.id),
            )?;
            tx.post(
                &Posting::credit(destination.id, amount, TransactionKind::TransferIn, description.clone())
                    .with_reference(transfer.id),
            )?;
            tx.insert_transfer(&transfer)?;
            Ok(TransferReceipt { transfer, entry })
        })?;
        self.observe(&result, "transfer", &[TransactionKind::TransferOut, TransactionKind::TransferIn]);
        if !result.replayed {
            tracing::info!(
                transfer_id = %result.value.transfer.id,
                from = %from_account,
                to = %destination.id,
                amount = %amount,
                "Transfer posted"
            );
        }
        Ok(result)
    }

    /// Ledger entries of one account, or of all the caller's accounts merged
    /// by sequence. Most recent first.
    pub fn list_transactions(
        &self,
        caller: &CallerIdentity,
        account_id: Option<Uuid>,
        page: Page,
    ) -> Result<Vec<LedgerEntry>, BankError> {
        if let Some(account_id) = account_id {
            self.accessible_account(caller, account_id)?;
            return Ok(self.storage.list_entries(account_id, page)?);
        }

        let user_id = caller.require_user()?;
        let mut entries = Vec::new();
        for account in self.storage.list_accounts(Some(user_id))? {
            let window = Page { limit: page.offset.saturating_add(page.limit), offset: 0 };
            entries.extend(self.storage.list_entries(account.id, window)?);
        }
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(entries.into_iter().skip(page.offset).take(page.limit).collect())
    }

    pub fn list_transfers(&self, caller: &CallerIdentity, page: Page) -> Result<Vec<Transfer>, BankError> {
        let user_id = caller.require_user()?;
        let ids: Vec<Uuid> = self
            .storage
            .list_accounts(Some(user_id))?
            .into_iter()
            .map(|a| a.id)
            .collect();
        Ok(self.storage.list_transfers(&ids, page)?)
    }

    fn observe<T>(&self, result: &Idempotent<T>, operation: &'static str, kinds: &[TransactionKind]) {
        if result.replayed {
            telemetry::record_idempotent_replay(operation);
        } else {
            for kind in kinds {
                telemetry::record_posting(*kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::testing::{admin, bank, customer};
    use rust_decimal_macros::dec;

    #[test]
    fn test_deposit_adds_to_balance() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 100);

        let result = bank.deposit(&alice, account.id, dec!(25.50), None, None).unwrap();
        assert!(!result.replayed);
        assert_eq!(result.value.balance_after, dec!(125.50));
        assert_eq!(result.value.description, "Deposit");
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(125.50));
    }

    #[test]
    fn test_withdraw_over_balance_writes_nothing() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 50);

        let err = bank.withdraw(&alice, account.id, dec!(50.01), None, None).unwrap_err();
        assert!(matches!(err, BankError::Storage(StorageError::InsufficientFunds { .. })));
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(50));
        assert_eq!(bank.list_transactions(&alice, Some(account.id), Page::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_account_reads_as_missing() {
        let bank = bank();
        let (_, alice_account) = customer(&bank, "alice", 50);
        let (bob, _) = customer(&bank, "bob", 0);

        let err = bank.withdraw(&bob, alice_account.id, dec!(1), None, None).unwrap_err();
        assert!(matches!(err, BankError::Storage(StorageError::NotFound { .. })));
        assert!(bank.deposit(&admin(), alice_account.id, dec!(1), None, None).is_ok());
    }

    #[test]
    fn test_transfer_moves_funds_atomically() {
        let bank = bank();
        let (alice, from) = customer(&bank, "alice", 100);
        let (bob, to) = customer(&bank, "bob", 0);

        let receipt = bank
            .transfer(&alice, from.id, &to.account_number, dec!(40), Some("rent"), None)
            .unwrap()
            .value;
        assert_eq!(receipt.entry.balance_after, dec!(60));
        assert_eq!(receipt.entry.reference, Some(receipt.transfer.id));
        assert_eq!(bank.storage().get_account(to.id).unwrap().balance, dec!(40));

        let bob_entries = bank.list_transactions(&bob, None, Page::default()).unwrap();
        assert_eq!(bob_entries.len(), 1);
        assert_eq!(bob_entries[0].kind, TransactionKind::TransferIn);
        assert_eq!(bank.list_transfers(&bob, Page::default()).unwrap().len(), 1);
        assert_eq!(bank.list_transfers(&alice, Page::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_transfer_failure_leaves_both_accounts_untouched() {
        let bank = bank();
        let (alice, from) = customer(&bank, "alice", 10);
        let (_, to) = customer(&bank, "bob", 0);

        assert!(bank.transfer(&alice, from.id, &to.account_number, dec!(11), None, None).is_err());
        assert_eq!(bank.storage().get_account(to.id).unwrap().balance, Decimal::ZERO);
        assert!(bank.list_transfers(&alice, Page::default()).unwrap().is_empty());

        let same = bank.transfer(&alice, from.id, &from.account_number, dec!(1), None, None);
        assert!(matches!(same, Err(BankError::Validation(_))));
    }

    #[test]
    fn test_idempotent_retry_applies_once() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 0);

        let first = bank.deposit(&alice, account.id, dec!(10), None, Some("k-1")).unwrap();
        let second = bank.deposit(&alice, account.id, dec!(10), None, Some("k-1")).unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.value, second.value);
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(10));

        let conflict = bank.deposit(&alice, account.id, dec!(11), None, Some("k-1")).unwrap_err();
        assert!(matches!(conflict, BankError::Storage(StorageError::IdempotencyConflict(_))));
    }

    #[test]
    fn test_idempotency_keys_are_scoped_per_user() {
        let bank = bank();
        let (alice, a) = customer(&bank, "alice", 0);
        let (bob, b) = customer(&bank, "bob", 0);

        bank.deposit(&alice, a.id, dec!(5), None, Some("same")).unwrap();
        let result = bank.deposit(&bob, b.id, dec!(7), None, Some("same")).unwrap();
        assert!(!result.replayed);
        assert_eq!(bank.storage().get_account(b.id).unwrap().balance, dec!(7));
    }
}
