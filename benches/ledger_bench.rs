use std::sync::Arc;

use bankd::{auth::CallerIdentity, Bank, Settings};
use bankd_core::{Account, AccountKind, Page, Role, StorageBackend, User};
use bankd_memory::InMemoryStorage;
use bankd_sqlite::SqliteStorage;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::OffsetDateTime;
use uuid::Uuid;

fn customer(bank: &Bank, name: &str, number: &str) -> (CallerIdentity, Account) {
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
    (caller, account)
}

fn setup(storage: Arc<dyn StorageBackend>) -> (Bank, CallerIdentity, Account, Account) {
    let bank = Bank::new(storage, Settings::default());
    let (alice, from) = customer(&bank, "alice", "100000000001");
    let (_, to) = customer(&bank, "bob", "100000000002");
    bank.deposit(&alice, from.id, dec!(1000000), None, None).unwrap();
    (bank, alice, from, to)
}

fn bench_deposit(c: &mut Criterion) {
    let (bank, alice, account, _) = setup(Arc::new(InMemoryStorage::new()));
    c.bench_function("memory_deposit", |b| {
        b.iter(|| bank.deposit(&alice, account.id, black_box(dec!(1.25)), None, None).unwrap())
    });

    let (bank, alice, account, _) = setup(Arc::new(SqliteStorage::new(":memory:").unwrap()));
    c.bench_function("sqlite_deposit", |b| {
        b.iter(|| bank.deposit(&alice, account.id, black_box(dec!(1.25)), None, None).unwrap())
    });
}

fn bench_transfer(c: &mut Criterion) {
    let (bank, alice, from, to) = setup(Arc::new(InMemoryStorage::new()));
    c.bench_function("memory_transfer", |b| {
        b.iter(|| {
            bank.transfer(&alice, from.id, &to.account_number, black_box(dec!(0.01)), None, None)
                .unwrap()
        })
    });

    let (bank, alice, from, to) = setup(Arc::new(SqliteStorage::new(":memory:").unwrap()));
    c.bench_function("sqlite_transfer", |b| {
        b.iter(|| {
            bank.transfer(&alice, from.id, &to.account_number, black_box(dec!(0.01)), None, None)
                .unwrap()
        })
    });
}

fn bench_idempotent_replay(c: &mut Criterion) {
    let (bank, alice, account, _) = setup(Arc::new(InMemoryStorage::new()));
    bank.deposit(&alice, account.id, dec!(3), None, Some("bench-key")).unwrap();
    c.bench_function("memory_idempotent_replay", |b| {
        b.iter(|| {
            bank.deposit(&alice, account.id, dec!(3), None, Some(black_box("bench-key")))
                .unwrap()
        })
    });
}

fn bench_statement(c: &mut Criterion) {
    let (bank, alice, account, _) = setup(Arc::new(InMemoryStorage::new()));
    for i in 1..=500 {
        bank.deposit(&alice, account.id, Decimal::from(i), None, None).unwrap();
    }
    c.bench_function("memory_statement_100", |b| {
        b.iter(|| bank.statement(&alice, account.id, black_box(Page::new(Some(100), None))).unwrap())
    });
}

criterion_group!(
    benches,
    bench_deposit,
    bench_transfer,
    bench_idempotent_replay,
    bench_statement
);
criterion_main!(benches);
