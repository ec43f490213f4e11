//! Banking services. Every balance change goes through
//! [`StorageBackend::atomically`] so a posting and its companion records
//! commit together.

use std::sync::Arc;

use bankd_core::{Account, IdempotencyRecord, StorageBackend, StorageError, StoreTx};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::CallerIdentity, config::Config, error::BankError, events::PaymentEvents};

pub mod accounts;
pub mod admin;
pub mod cards;
pub mod expenditures;
pub mod identity;
pub mod investments;
pub mod ledger;
pub mod loans;
pub mod payments;

pub use accounts::{AccountBalance, BalanceSummary};
pub use admin::Overview;
pub use cards::IssuedCard;
pub use expenditures::{Analytics, MonthlyFlow};
pub use identity::{NewUser, OtpRequested, Registration, SignIn};
pub use ledger::TransferReceipt;

#[derive(Debug, Clone)]
pub struct Settings {
    pub session_ttl: time::Duration,
    pub otp_ttl: time::Duration,
    pub otp_max_attempts: u32,
    pub echo_otp: bool,
    pub settle_delay: std::time::Duration,
    pub loan_annual_rate: Decimal,
    pub max_loan_principal: Decimal,
    pub max_transaction_amount: Decimal,
}

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_ttl: time::Duration::minutes(config.auth.session_ttl_minutes),
            otp_ttl: time::Duration::seconds(config.auth.otp_ttl_seconds),
            otp_max_attempts: config.auth.otp_max_attempts.max(1),
            echo_otp: config.auth.echo_otp,
            settle_delay: std::time::Duration::from_millis(config.payments.settle_delay_ms),
            loan_annual_rate: config.loans.annual_rate,
            max_loan_principal: config.loans.max_principal,
            max_transaction_amount: config.limits.max_transaction_amount,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Result of an idempotent operation. `replayed` is set when the stored
/// response of an earlier request with the same key was returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idempotent<T> {
    pub value: T,
    pub replayed: bool,
}

#[derive(Clone)]
pub struct Bank {
    storage: Arc<dyn StorageBackend>,
    events: PaymentEvents,
    settings: Arc<Settings>,
}

impl Bank {
    pub fn new(storage: Arc<dyn StorageBackend>, settings: Settings) -> Self {
        Self {
            storage,
            events: PaymentEvents::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn events(&self) -> &PaymentEvents {
        &self.events
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Loads an account the caller may act on. Foreign accounts read as missing.
    pub(crate) fn accessible_account(&self, caller: &CallerIdentity, account_id: Uuid) -> Result<Account, BankError> {
        let account = self.storage.get_account(account_id)?;
        if !caller.can_access(account.user_id) {
            return Err(StorageError::not_found("account", account_id).into());
        }
        Ok(account)
    }

    /// Runs `work` in one unit of work, recording its response under `key`.
    ///
    /// A repeated key with the same fingerprint returns the stored response
    /// without running `work`; a different fingerprint is a conflict.
    pub(crate) fn run_idempotent<T, F>(
        &self,
        caller: &CallerIdentity,
        key: Option<&str>,
        fingerprint: &str,
        mut work: F,
    ) -> Result<Idempotent<T>, BankError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut dyn StoreTx) -> Result<T, StorageError>,
    {
        let scope = caller.scope();
        let mut outcome: Option<Idempotent<T>> = None;

        self.storage.atomically(&mut |tx: &mut dyn StoreTx| {
            if let Some(key) = key {
                if let Some(record) = tx.idempotency_record(scope, key)? {
                    if record.fingerprint != fingerprint {
                        return Err(StorageError::IdempotencyConflict(key.to_string()));
                    }
                    let value = serde_json::from_str(&record.response)
                        .map_err(|e| StorageError::Corrupt(format!("stored response for {}: {}", key, e)))?;
                    outcome = Some(Idempotent { value, replayed: true });
                    return Ok(());
                }
            }

            let value = work(tx)?;
            if let Some(key) = key {
                let response = serde_json::to_string(&value).map_err(|e| StorageError::Other(e.to_string()))?;
                tx.save_idempotency_record(&IdempotencyRecord {
                    user_id: scope,
                    key: key.to_string(),
                    fingerprint: fingerprint.to_string(),
                    response,
                    created_at: OffsetDateTime::now_utc(),
                })?;
            }
            outcome = Some(Idempotent { value, replayed: false });
            Ok(())
        })?;

        outcome.ok_or_else(|| BankError::Internal("unit of work finished without a result".to_string()))
    }
}

/// Inside a unit: the account, if the caller may act on it.
pub(crate) fn owned_in_tx(
    tx: &mut dyn StoreTx,
    caller: &CallerIdentity,
    account_id: Uuid,
) -> Result<Account, StorageError> {
    let account = tx.account(account_id)?;
    if !caller.can_access(account.user_id) {
        return Err(StorageError::not_found("account", account_id));
    }
    Ok(account)
}
