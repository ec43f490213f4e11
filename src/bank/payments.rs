use std::time::Duration;

use bankd_core::{Payment, PaymentStatus, Posting, StorageError, StoreTx, TransactionKind};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{owned_in_tx, Bank, Idempotent};
use crate::{auth::CallerIdentity, error::BankError, events::PaymentEvent, telemetry, validation};

const SETTLE_ATTEMPTS: u32 = 5;
const SETTLE_BACKOFF: Duration = Duration::from_millis(100);

impl Bank {
    /// Records a `processing` payment and schedules its settlement.
    ///
    /// Must be called inside a tokio runtime.
    pub fn create_payment(
        &self,
        caller: &CallerIdentity,
        account_id: Uuid,
        payee: &str,
        amount: Decimal,
        key: Option<&str>,
    ) -> Result<Idempotent<Payment>, BankError> {
        let user_id = caller.require_user()?;
        let payee = validation::required("payee", payee)?;
        let amount = validation::amount(amount, self.settings.max_transaction_amount)?;
        let fingerprint = format!("payment:{}:{}:{}", account_id, payee, amount);

        let result = self.run_idempotent(caller, key, &fingerprint, |tx| {
            let account = owned_in_tx(tx, caller, account_id)?;
            if !account.is_active() {
                return Err(StorageError::AccountInactive(account.id));
            }
            let now = OffsetDateTime::now_utc();
            let payment = Payment {
                id: Uuid::new_v4(),
                user_id,
                account_id,
                payee: payee.clone(),
                amount,
                status: PaymentStatus::Processing,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            };
            tx.save_payment(&payment)?;
            Ok(payment)
        })?;

        if result.replayed {
            telemetry::record_idempotent_replay("payment");
            return Ok(result);
        }

        let payment = &result.value;
        tracing::info!(payment_id = %payment.id, payee = %payment.payee, amount = %amount, "Payment accepted");
        telemetry::record_payment(PaymentStatus::Processing);
        self.events.publish(PaymentEvent::from(payment));

        self.schedule_settlement(payment.id, self.settings.settle_delay);

        Ok(result)
    }

    /// Schedules every payment still `processing`, for instance after a
    /// restart. Each settles once what remains of its delay has passed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn resume_pending_payments(&self) -> Result<usize, BankError> {
        let pending = self.storage.list_payments_by_status(PaymentStatus::Processing)?;
        let now = OffsetDateTime::now_utc();
        for payment in &pending {
            let elapsed = now - payment.created_at;
            let remaining = self.settings.settle_delay.saturating_sub(elapsed.try_into().unwrap_or_default());
            tracing::info!(payment_id = %payment.id, "Resuming payment settlement");
            self.schedule_settlement(payment.id, remaining);
        }
        Ok(pending.len())
    }

    fn schedule_settlement(&self, payment_id: Uuid, delay: Duration) {
        let bank = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut backoff = SETTLE_BACKOFF;
            for attempt in 1..=SETTLE_ATTEMPTS {
                match bank.settle_payment(payment_id) {
                    Ok(_) => return,
                    Err(e) if e.is_retryable() && attempt < SETTLE_ATTEMPTS => {
                        tracing::warn!(payment_id = %payment_id, attempt, error = %e, "Payment settlement busy, retrying");
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                    Err(e) => {
                        tracing::error!(payment_id = %payment_id, attempt, error = %e, "Payment settlement failed");
                        return;
                    }
                }
            }
        });
    }

    /// Debits the payment and marks it `success`. If the debit is refused the
    /// payment is marked `failed` in a separate unit. Settled payments are
    /// returned unchanged.
    pub fn settle_payment(&self, payment_id: Uuid) -> Result<Payment, BankError> {
        let mut settled = None;
        let mut transitioned = false;
        let outcome = self.storage.atomically(&mut |tx: &mut dyn StoreTx| {
            transitioned = false;
            let mut payment = tx.payment(payment_id)?;
            if payment.status == PaymentStatus::Processing {
                tx.post(
                    &Posting::debit(
                        payment.account_id,
                        payment.amount,
                        TransactionKind::Payment,
                        format!("Payment to {}", payment.payee),
                    )
                    .with_reference(payment.id),
                )?;
                payment.status = PaymentStatus::Success;
                payment.updated_at = OffsetDateTime::now_utc();
                tx.save_payment(&payment)?;
                transitioned = true;
            }
            settled = Some(payment);
            Ok(())
        });

        let payment = match outcome {
            Ok(()) => settled.ok_or_else(|| BankError::Internal("settlement produced no result".to_string()))?,
            Err(e @ (StorageError::InsufficientFunds { .. } | StorageError::AccountInactive(_))) => {
                let (payment, failed) = self.fail_payment(payment_id, &e)?;
                transitioned = failed;
                payment
            }
            Err(StorageError::NotFound { entity: "account", .. }) => {
                let reason = StorageError::not_found("account", "funding account");
                let (payment, failed) = self.fail_payment(payment_id, &reason)?;
                transitioned = failed;
                payment
            }
            Err(e) => return Err(e.into()),
        };

        if transitioned {
            match payment.status {
                PaymentStatus::Success => {
                    telemetry::record_posting(TransactionKind::Payment);
                    tracing::info!(payment_id = %payment.id, "Payment settled");
                }
                _ => tracing::info!(
                    payment_id = %payment.id,
                    reason = payment.failure_reason.as_deref().unwrap_or(""),
                    "Payment failed"
                ),
            }
            telemetry::record_payment(payment.status);
            self.events.publish(PaymentEvent::from(&payment));
        }
        Ok(payment)
    }

    /// Marks a `processing` payment failed. The flag is set when this call
    /// made the change.
    fn fail_payment(&self, payment_id: Uuid, reason: &StorageError) -> Result<(Payment, bool), BankError> {
        let mut failed = None;
        self.storage.atomically(&mut |tx: &mut dyn StoreTx| {
            let mut payment = tx.payment(payment_id)?;
            let pending = payment.status == PaymentStatus::Processing;
            if pending {
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(reason.to_string());
                payment.updated_at = OffsetDateTime::now_utc();
                tx.save_payment(&payment)?;
            }
            failed = Some((payment, pending));
            Ok(())
        })?;
        failed.ok_or_else(|| BankError::Internal("payment failure produced no result".to_string()))
    }

    pub fn list_payments(&self, caller: &CallerIdentity) -> Result<Vec<Payment>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_payments(user_id)?)
    }

    pub fn get_payment(&self, caller: &CallerIdentity, payment_id: Uuid) -> Result<Payment, BankError> {
        let payment = self.storage.get_payment(payment_id)?;
        if !caller.can_access(payment.user_id) {
            return Err(StorageError::not_found("payment", payment_id).into());
        }
        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc};

    use super::*;
    use crate::bank::{
        testing::{bank, customer, FlakyStorage},
        Settings,
    };
    use bankd_core::StorageBackend;
    use bankd_memory::InMemoryStorage;
    use bankd_sqlite::SqliteStorage;
    use rust_decimal_macros::dec;

    fn settling_after(delay: Duration) -> Settings {
        Settings {
            settle_delay: delay,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_payment_settles_and_emits_events_in_order() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 100);
        let mut events = bank.events().subscribe();

        let payment = bank.create_payment(&alice, account.id, "Power Co", dec!(30), None).unwrap().value;
        assert_eq!(payment.status, PaymentStatus::Processing);

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!((first.payment_id, first.status), (payment.id, PaymentStatus::Processing));
        assert_eq!((second.payment_id, second.status), (payment.id, PaymentStatus::Success));

        assert_eq!(bank.get_payment(&alice, payment.id).unwrap().status, PaymentStatus::Success);
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(70));
    }

    #[tokio::test]
    async fn test_underfunded_payment_fails_without_debit() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 10);
        let mut events = bank.events().subscribe();

        let payment = bank.create_payment(&alice, account.id, "Landlord", dec!(900), None).unwrap().value;
        events.recv().await.unwrap();
        let last = events.recv().await.unwrap();
        assert_eq!(last.status, PaymentStatus::Failed);
        assert!(last.failure_reason.unwrap().contains("insufficient funds"));

        let stored = bank.get_payment(&alice, payment.id).unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(10));
    }

    #[tokio::test]
    async fn test_settlement_is_applied_once() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 100);
        let mut events = bank.events().subscribe();
        let payment = bank.create_payment(&alice, account.id, "Gym", dec!(20), None).unwrap().value;
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        let again = bank.settle_payment(payment.id).unwrap();
        assert_eq!(again.status, PaymentStatus::Success);
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(80));
    }

    #[tokio::test]
    async fn test_payments_are_private() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 100);
        let (bob, _) = customer(&bank, "bob", 0);
        let payment = bank.create_payment(&alice, account.id, "Gym", dec!(20), None).unwrap().value;

        assert!(bank.get_payment(&bob, payment.id).is_err());
        assert!(bank.list_payments(&bob).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_payments_resume_on_a_new_bank() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let before = Bank::new(storage.clone(), settling_after(Duration::from_secs(3600)));
        let (alice, account) = customer(&before, "alice", 100);
        let payment = before.create_payment(&alice, account.id, "Water Co", dec!(30), None).unwrap().value;

        let after = Bank::new(storage.clone(), settling_after(Duration::ZERO));
        let mut events = after.events().subscribe();
        assert_eq!(after.resume_pending_payments().unwrap(), 1);

        let settled = events.recv().await.unwrap();
        assert_eq!((settled.payment_id, settled.status), (payment.id, PaymentStatus::Success));
        assert_eq!(storage.get_account(account.id).unwrap().balance, dec!(70));
        assert_eq!(after.resume_pending_payments().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sqlite_payment_settles_after_reopen() {
        let path = std::env::temp_dir().join(format!("bankd-payments-{}.db", Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();

        let (payment, account) = {
            let before = Bank::new(
                Arc::new(SqliteStorage::new(&path).unwrap()),
                settling_after(Duration::from_secs(3600)),
            );
            let (alice, account) = customer(&before, "alice", 100);
            let payment = before.create_payment(&alice, account.id, "Water Co", dec!(30), None).unwrap().value;
            (payment, account)
        };

        let after = Bank::new(Arc::new(SqliteStorage::new(&path).unwrap()), settling_after(Duration::ZERO));
        assert_eq!(after.storage().get_payment(payment.id).unwrap().status, PaymentStatus::Processing);
        let mut events = after.events().subscribe();
        assert_eq!(after.resume_pending_payments().unwrap(), 1);

        let settled = events.recv().await.unwrap();
        assert_eq!(settled.status, PaymentStatus::Success);
        assert_eq!(after.storage().get_payment(payment.id).unwrap().status, PaymentStatus::Success);
        assert_eq!(after.storage().get_account(account.id).unwrap().balance, dec!(70));

        drop(after);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_busy_settlement_is_retried() {
        let storage = Arc::new(FlakyStorage::default());
        let bank = Bank::new(storage.clone(), settling_after(Duration::ZERO));
        let (alice, account) = customer(&bank, "alice", 100);
        let mut events = bank.events().subscribe();

        let payment = bank.create_payment(&alice, account.id, "Gym", dec!(25), None).unwrap().value;
        storage.busy_units.store(2, Ordering::SeqCst);

        events.recv().await.unwrap();
        let settled = events.recv().await.unwrap();
        assert_eq!((settled.payment_id, settled.status), (payment.id, PaymentStatus::Success));
        assert_eq!(storage.busy_units.load(Ordering::SeqCst), 0);
        assert_eq!(bank.storage().get_account(account.id).unwrap().balance, dec!(75));
    }

    #[tokio::test]
    async fn test_repeated_settlement_publishes_once() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 100);
        let payment = bank.create_payment(&alice, account.id, "Gym", dec!(20), None).unwrap().value;
        bank.settle_payment(payment.id).unwrap();

        let mut events = bank.events().subscribe();
        bank.settle_payment(payment.id).unwrap();
        assert!(events.try_recv().is_err());
    }
}
