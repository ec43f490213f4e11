//! The same ledger scenarios run against every storage backend.

use std::sync::Arc;

use bankd::{auth::CallerIdentity, Bank, BankError, Settings};
use bankd_core::{
    Account, AccountKind, Page, Payment, PaymentStatus, Role, Session, StorageBackend, StorageError, User,
};
use bankd_memory::InMemoryStorage;
use bankd_sqlite::SqliteStorage;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use uuid::Uuid;

fn memory() -> Arc<dyn StorageBackend> {
    Arc::new(InMemoryStorage::new())
}

fn sqlite() -> Arc<dyn StorageBackend> {
    Arc::new(SqliteStorage::new(":memory:").unwrap())
}

fn customer(storage: &Arc<dyn StorageBackend>, name: &str) -> (CallerIdentity, Account) {
    let user = User {
        id: Uuid::new_v4(),
        email: format!("{}@example.com", name),
        username: name.to_string(),
        full_name: name.to_string(),
        phone: None,
        password_hash: String::new(),
        role: Role::Customer,
        created_at: OffsetDateTime::now_utc(),
    };
    storage.create_user(&user).unwrap();
    let account = Account::open(user.id, format!("9{:011}", rand_suffix(&user.id)), AccountKind::Checking);
    storage.create_account(&account).unwrap();
    let caller = CallerIdentity {
        user_id: Some(user.id),
        name: user.username,
        role: Role::Customer,
        session_token: None,
    };
    (caller, account)
}

fn rand_suffix(id: &Uuid) -> u64 {
    (id.as_u128() % 100_000_000_000) as u64
}

fn deposit_then_withdraw(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = customer(&storage, "alice");

    bank.deposit(&alice, account.id, dec!(100), None, None).unwrap();
    bank.withdraw(&alice, account.id, dec!(30), Some("atm"), None).unwrap();

    assert_eq!(storage.get_account(account.id).unwrap().balance, dec!(70));
    let entries = storage.list_entries(account.id, Page::default()).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].amount, dec!(-30));
    assert_eq!(entries[0].balance_after, dec!(70));
    assert!(entries[0].sequence > entries[1].sequence);
}

fn overdraft_writes_nothing(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = customer(&storage, "alice");
    bank.deposit(&alice, account.id, dec!(10), None, None).unwrap();

    let err = bank.withdraw(&alice, account.id, dec!(10.01), None, None).unwrap_err();
    assert!(matches!(err, BankError::Storage(StorageError::InsufficientFunds { .. })));
    assert_eq!(storage.get_account(account.id).unwrap().balance, dec!(10));
    assert_eq!(storage.list_entries(account.id, Page::default()).unwrap().len(), 1);
}

fn transfer_is_atomic(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, from) = customer(&storage, "alice");
    let (_, to) = customer(&storage, "bob");
    bank.deposit(&alice, from.id, dec!(50), None, None).unwrap();

    bank.transfer(&alice, from.id, &to.account_number, dec!(20), None, None).unwrap();
    assert!(bank.transfer(&alice, from.id, &to.account_number, dec!(31), None, None).is_err());

    assert_eq!(storage.get_account(from.id).unwrap().balance, dec!(30));
    assert_eq!(storage.get_account(to.id).unwrap().balance, dec!(20));
    assert_eq!(storage.list_transfers(&[from.id], Page::default()).unwrap().len(), 1);
    assert_eq!(storage.list_entries(to.id, Page::default()).unwrap().len(), 1);
}

fn idempotent_replay(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = customer(&storage, "alice");

    let first = bank.deposit(&alice, account.id, dec!(5), None, Some("k-1")).unwrap();
    let second = bank.deposit(&alice, account.id, dec!(5), None, Some("k-1")).unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.value, second.value);
    assert_eq!(storage.get_account(account.id).unwrap().balance, dec!(5));

    let err = bank.deposit(&alice, account.id, dec!(6), None, Some("k-1")).unwrap_err();
    assert!(matches!(err, BankError::Storage(StorageError::IdempotencyConflict(_))));

    // keys are scoped per user
    let (bob, bob_account) = customer(&storage, "bob");
    let other = bank.deposit(&bob, bob_account.id, dec!(5), None, Some("k-1")).unwrap();
    assert!(!other.replayed);
}

fn duplicate_logins_rejected(storage: Arc<dyn StorageBackend>) {
    let (alice, _) = customer(&storage, "alice");
    let clash = User {
        id: Uuid::new_v4(),
        email: "ALICE@example.com".to_string(),
        username: "someone-else".to_string(),
        full_name: "Clash".to_string(),
        phone: None,
        password_hash: String::new(),
        role: Role::Customer,
        created_at: OffsetDateTime::now_utc(),
    };
    assert!(matches!(storage.create_user(&clash), Err(StorageError::AlreadyExists(_))));
    let found = storage.find_user_by_login("Alice@Example.com").unwrap().unwrap();
    assert_eq!(Some(found.id), alice.user_id);
}

fn paging_is_most_recent_first(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = customer(&storage, "alice");
    for i in 1..=5 {
        bank.deposit(&alice, account.id, rust_decimal::Decimal::from(i), None, None).unwrap();
    }
    let page = storage.list_entries(account.id, Page::new(Some(2), Some(1))).unwrap();
    let amounts: Vec<_> = page.iter().map(|e| e.amount).collect();
    assert_eq!(amounts, vec![dec!(4), dec!(3)]);
}

fn deleting_a_user_keeps_funded_accounts(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, funded) = customer(&storage, "alice");
    let alice_id = alice.user_id.unwrap();
    bank.deposit(&alice, funded.id, dec!(5), None, None).unwrap();
    let empty = Account::open(alice_id, "800000000001".to_string(), AccountKind::Savings);
    storage.create_account(&empty).unwrap();
    let now = OffsetDateTime::now_utc();
    storage
        .create_session(&Session {
            token: "alice-session".to_string(),
            user_id: alice_id,
            created_at: now,
            expires_at: now + time::Duration::hours(1),
        })
        .unwrap();

    storage.delete_user(alice_id).unwrap();

    assert!(matches!(storage.get_user(alice_id), Err(StorageError::NotFound { .. })));
    assert!(storage.find_user_by_login("alice").unwrap().is_none());
    assert!(storage.get_session("alice-session").unwrap().is_none());
    assert!(matches!(storage.get_account(empty.id), Err(StorageError::NotFound { .. })));
    assert_eq!(storage.get_account(funded.id).unwrap().balance, dec!(5));

    // the login is free again
    customer(&storage, "alice");
}

fn processing_payments_are_listed_oldest_first(storage: Arc<dyn StorageBackend>) {
    let (alice, account) = customer(&storage, "alice");
    let now = OffsetDateTime::now_utc();
    let payment = |payee: &str, status: PaymentStatus, age: i64| Payment {
        id: Uuid::new_v4(),
        user_id: alice.user_id.unwrap(),
        account_id: account.id,
        payee: payee.to_string(),
        amount: dec!(1),
        status,
        failure_reason: None,
        created_at: now - time::Duration::minutes(age),
        updated_at: now,
    };
    storage.create_payment(&payment("newer", PaymentStatus::Processing, 1)).unwrap();
    storage.create_payment(&payment("settled", PaymentStatus::Success, 3)).unwrap();
    storage.create_payment(&payment("older", PaymentStatus::Processing, 2)).unwrap();

    let pending = storage.list_payments_by_status(PaymentStatus::Processing).unwrap();
    let payees: Vec<_> = pending.iter().map(|p| p.payee.as_str()).collect();
    assert_eq!(payees, vec!["older", "newer"]);
    assert_eq!(storage.list_payments_by_status(PaymentStatus::Failed).unwrap().len(), 0);
}

macro_rules! conformance {
    ($($scenario:ident),+ $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<memory_ $scenario>]() {
                    $scenario(memory());
                }

                #[test]
                fn [<sqlite_ $scenario>]() {
                    $scenario(sqlite());
                }
            )+
        }
    };
}

conformance!(
    deposit_then_withdraw,
    overdraft_writes_nothing,
    transfer_is_atomic,
    idempotent_replay,
    duplicate_logins_rejected,
    paging_is_most_recent_first,
    deleting_a_user_keeps_funded_accounts,
    processing_payments_are_listed_oldest_first,
);
