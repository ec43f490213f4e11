use std::sync::Arc;

use bankd::{auth::CallerIdentity, Bank, BankError, Settings};
use bankd_core::{Account, AccountKind, Page, Role, StorageBackend, StorageError, User};
use bankd_memory::InMemoryStorage;
use bankd_sqlite::SqliteStorage;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use uuid::Uuid;

const WITHDRAWALS: usize = 40;

fn funded_customer(bank: &Bank, name: &str, number: &str, funds: Decimal) -> (CallerIdentity, Account) {
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
    bank.storage().create_user(&user).unwrap();
    let account = Account::open(user.id, number.to_string(), AccountKind::Checking);
    bank.storage().create_account(&account).unwrap();
    let caller = CallerIdentity {
        user_id: Some(user.id),
        name: user.username,
        role: Role::Customer,
        session_token: None,
    };
    if funds > Decimal::ZERO {
        bank.deposit(&caller, account.id, funds, None, None).unwrap();
    }
    (caller, account)
}

fn ledger_total(storage: &Arc<dyn StorageBackend>, account_id: Uuid) -> Decimal {
    storage
        .list_entries(account_id, Page::all())
        .unwrap()
        .iter()
        .map(|e| e.amount)
        .sum()
}

async fn racing_withdrawals(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = funded_customer(&bank, "alice", "100000000001", dec!(100));

    let tasks: Vec<_> = (0..WITHDRAWALS)
        .map(|_| {
            let bank = bank.clone();
            let alice = alice.clone();
            tokio::task::spawn_blocking(move || bank.withdraw(&alice, account.id, dec!(10), None, None))
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BankError::Storage(StorageError::InsufficientFunds { .. })) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let balance = storage.get_account(account.id).unwrap().balance;
    assert_eq!(succeeded, 10);
    assert_eq!(balance, Decimal::ZERO);
    assert_eq!(ledger_total(&storage, account.id), balance);
}

async fn opposing_transfers(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, a) = funded_customer(&bank, "alice", "200000000001", dec!(500));
    let (bob, b) = funded_customer(&bank, "bob", "200000000002", dec!(500));

    let mut tasks = Vec::new();
    for i in 0..WITHDRAWALS {
        let bank = bank.clone();
        let (caller, from, to) = if i % 2 == 0 {
            (alice.clone(), a.id, b.account_number.clone())
        } else {
            (bob.clone(), b.id, a.account_number.clone())
        };
        tasks.push(tokio::task::spawn_blocking(move || {
            bank.transfer(&caller, from, &to, dec!(7.25), None, None)
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let a_balance = storage.get_account(a.id).unwrap().balance;
    let b_balance = storage.get_account(b.id).unwrap().balance;
    assert_eq!(a_balance + b_balance, dec!(1000));
    assert_eq!(a_balance, dec!(500));
    assert_eq!(ledger_total(&storage, a.id), a_balance);
    assert_eq!(ledger_total(&storage, b.id), b_balance);
}

async fn concurrent_idempotent_retries(storage: Arc<dyn StorageBackend>) {
    let bank = Bank::new(storage.clone(), Settings::default());
    let (alice, account) = funded_customer(&bank, "alice", "300000000001", dec!(0));

    let tasks: Vec<_> = (0..WITHDRAWALS)
        .map(|_| {
            let bank = bank.clone();
            let alice = alice.clone();
            tokio::task::spawn_blocking(move || bank.deposit(&alice, account.id, dec!(15), None, Some("retry-me")))
        })
        .collect();

    let mut fresh = 0;
    for task in tasks {
        if !task.await.unwrap().unwrap().replayed {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(storage.get_account(account.id).unwrap().balance, dec!(15));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_withdrawals_memory() {
    racing_withdrawals(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_withdrawals_sqlite() {
    racing_withdrawals(Arc::new(SqliteStorage::new(":memory:").unwrap())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_memory() {
    opposing_transfers(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_transfers_sqlite() {
    opposing_transfers(Arc::new(SqliteStorage::new(":memory:").unwrap())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_idempotent_retries_memory() {
    concurrent_idempotent_retries(Arc::new(InMemoryStorage::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_idempotent_retries_sqlite() {
    concurrent_idempotent_retries(Arc::new(SqliteStorage::new(":memory:").unwrap())).await;
}
