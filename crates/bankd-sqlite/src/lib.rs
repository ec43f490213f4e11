//! SQLite storage backend for bankd.
//!
//! One connection guarded by a mutex. Units of work run inside an
//! `IMMEDIATE` transaction so the write lock is held from the first read.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use rusqlite::{
    params, params_from_iter,
    types::{Type, Value},
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use rust_decimal::Decimal;
use time::{format_description::FormatItem, macros::format_description, Date, OffsetDateTime};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use bankd_core::{
    Account, AccountStatus, Card, CardStatus, Expenditure, IdempotencyRecord, Investment,
    LedgerEntry, Loan, OtpChallenge, Page, Payment, PaymentStatus, Posting, Session, StorageBackend,
    StorageError, StoreTx, Transfer, UnitOfWork, User,
};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

const USER_COLUMNS: &str = "id, email, username, full_name, phone, password_hash, role, created_at";
const ACCOUNT_COLUMNS: &str = "id, user_id, account_number, kind, status, balance, created_at";
const ENTRY_COLUMNS: &str =
    "id, sequence, account_id, kind, amount, balance_after, description, reference, created_at";
const CARD_COLUMNS: &str = "id, user_id, account_id, kind, masked_number, last4, holder_name, expiry_month, expiry_year, status, created_at";
const LOAN_COLUMNS: &str = "id, user_id, account_id, principal, annual_rate, term_months, monthly_installment, outstanding, purpose, status, created_at, decided_at";
const PAYMENT_COLUMNS: &str =
    "id, user_id, account_id, payee, amount, status, failure_reason, created_at, updated_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    tx_counter: AtomicU64,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
            .map_err(sql_err)?;

        let storage = Self {
            conn: Mutex::new(conn),
            tx_counter: AtomicU64::new(1),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Other("connection lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                username TEXT NOT NULL UNIQUE COLLATE NOCASE,
                full_name TEXT NOT NULL,
                phone TEXT,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );

            CREATE TABLE IF NOT EXISTS otp_challenges (
                email TEXT PRIMARY KEY,
                code TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                attempts_left INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_number TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                balance TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ledger_entries (
                id TEXT PRIMARY KEY,
                sequence INTEGER NOT NULL UNIQUE,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                balance_after TEXT NOT NULL,
                description TEXT NOT NULL,
                reference TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_ledger_account_sequence
                ON ledger_entries(account_id, sequence);

            CREATE TABLE IF NOT EXISTS transfers (
                id TEXT PRIMARY KEY,
                from_account TEXT NOT NULL,
                to_account TEXT NOT NULL,
                amount TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cards (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                masked_number TEXT NOT NULL,
                last4 TEXT NOT NULL,
                holder_name TEXT NOT NULL,
                expiry_month INTEGER NOT NULL,
                expiry_year INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS loans (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                principal TEXT NOT NULL,
                annual_rate TEXT NOT NULL,
                term_months INTEGER NOT NULL,
                monthly_installment TEXT NOT NULL,
                outstanding TEXT NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                decided_at TEXT
            );

            CREATE TABLE IF NOT EXISTS investments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                product TEXT NOT NULL,
                amount TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                payee TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS expenditures (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                amount TEXT NOT NULL,
                note TEXT NOT NULL,
                spent_on TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS idempotency_keys (
                user_id TEXT NOT NULL,
                key TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                response TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, key)
            );

            CREATE TABLE IF NOT EXISTS sequence_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO sequence_counter (id, value) VALUES (1, 0);
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Busy(e.to_string())
        }
        rusqlite::Error::FromSqlConversionFailure(..) => StorageError::Corrupt(e.to_string()),
        _ => StorageError::Other(e.to_string()),
    }
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Reads a text column and parses it with `FromStr`.
fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion(idx, e))
}

fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse::<T>().map_err(|e| conversion(idx, e))).transpose()
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    OffsetDateTime::parse(&raw, &Rfc3339).map_err(|e| conversion(idx, e))
}

fn timestamp_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| OffsetDateTime::parse(&s, &Rfc3339).map_err(|e| conversion(idx, e)))
        .transpose()
}

fn ts(t: OffsetDateTime) -> Result<String, StorageError> {
    t.format(&Rfc3339).map_err(|e| StorageError::Other(e.to_string()))
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: parsed(row, 0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        full_name: row.get(3)?,
        phone: row.get(4)?,
        password_hash: row.get(5)?,
        role: parsed(row, 6)?,
        created_at: timestamp(row, 7)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        token: row.get(0)?,
        user_id: parsed(row, 1)?,
        created_at: timestamp(row, 2)?,
        expires_at: timestamp(row, 3)?,
    })
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        account_number: row.get(2)?,
        kind: parsed(row, 3)?,
        status: parsed(row, 4)?,
        balance: parsed(row, 5)?,
        created_at: timestamp(row, 6)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: parsed(row, 0)?,
        sequence: row.get(1)?,
        account_id: parsed(row, 2)?,
        kind: parsed(row, 3)?,
        amount: parsed(row, 4)?,
        balance_after: parsed(row, 5)?,
        description: row.get(6)?,
        reference: parsed_opt(row, 7)?,
        created_at: timestamp(row, 8)?,
    })
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: parsed(row, 0)?,
        from_account: parsed(row, 1)?,
        to_account: parsed(row, 2)?,
        amount: parsed(row, 3)?,
        description: row.get(4)?,
        created_at: timestamp(row, 5)?,
    })
}

fn card_from_row(row: &Row<'_>) -> rusqlite::Result<Card> {
    Ok(Card {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        account_id: parsed(row, 2)?,
        kind: parsed(row, 3)?,
        masked_number: row.get(4)?,
        last4: row.get(5)?,
        holder_name: row.get(6)?,
        expiry_month: row.get(7)?,
        expiry_year: row.get(8)?,
        status: parsed(row, 9)?,
        created_at: timestamp(row, 10)?,
    })
}

fn loan_from_row(row: &Row<'_>) -> rusqlite::Result<Loan> {
    Ok(Loan {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        account_id: parsed(row, 2)?,
        principal: parsed(row, 3)?,
        annual_rate: parsed(row, 4)?,
        term_months: row.get(5)?,
        monthly_installment: parsed(row, 6)?,
        outstanding: parsed(row, 7)?,
        purpose: row.get(8)?,
        status: parsed(row, 9)?,
        created_at: timestamp(row, 10)?,
        decided_at: timestamp_opt(row, 11)?,
    })
}

fn investment_from_row(row: &Row<'_>) -> rusqlite::Result<Investment> {
    Ok(Investment {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        account_id: parsed(row, 2)?,
        product: row.get(3)?,
        amount: parsed(row, 4)?,
        created_at: timestamp(row, 5)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        account_id: parsed(row, 2)?,
        payee: row.get(3)?,
        amount: parsed(row, 4)?,
        status: parsed(row, 5)?,
        failure_reason: row.get(6)?,
        created_at: timestamp(row, 7)?,
        updated_at: timestamp(row, 8)?,
    })
}

fn expenditure_from_row(row: &Row<'_>) -> rusqlite::Result<Expenditure> {
    let raw: String = row.get(5)?;
    Ok(Expenditure {
        id: parsed(row, 0)?,
        user_id: parsed(row, 1)?,
        category: row.get(2)?,
        amount: parsed(row, 3)?,
        note: row.get(4)?,
        spent_on: Date::parse(&raw, DATE_FORMAT).map_err(|e| conversion(5, e))?,
        created_at: timestamp(row, 6)?,
    })
}

// Queries shared by the storage methods and by `SqliteTx`.

fn fetch_account(conn: &Connection, id: Uuid) -> Result<Account, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
        params![id.to_string()],
        account_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| StorageError::not_found("account", id))
}

fn fetch_loan(conn: &Connection, id: Uuid) -> Result<Loan, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM loans WHERE id = ?1", LOAN_COLUMNS),
        params![id.to_string()],
        loan_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| StorageError::not_found("loan", id))
}

fn fetch_payment(conn: &Connection, id: Uuid) -> Result<Payment, StorageError> {
    conn.query_row(
        &format!("SELECT {} FROM payments WHERE id = ?1", PAYMENT_COLUMNS),
        params![id.to_string()],
        payment_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| StorageError::not_found("payment", id))
}

fn upsert_loan(conn: &Connection, loan: &Loan) -> Result<(), StorageError> {
    let decided_at = loan.decided_at.map(ts).transpose()?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO loans ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            LOAN_COLUMNS
        ),
        params![
            loan.id.to_string(),
            loan.user_id.to_string(),
            loan.account_id.to_string(),
            loan.principal.to_string(),
            loan.annual_rate.to_string(),
            loan.term_months,
            loan.monthly_installment.to_string(),
            loan.outstanding.to_string(),
            loan.purpose,
            loan.status.as_str(),
            ts(loan.created_at)?,
            decided_at,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn upsert_payment(conn: &Connection, payment: &Payment) -> Result<(), StorageError> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO payments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            PAYMENT_COLUMNS
        ),
        params![
            payment.id.to_string(),
            payment.user_id.to_string(),
            payment.account_id.to_string(),
            payment.payee,
            payment.amount.to_string(),
            payment.status.as_str(),
            payment.failure_reason,
            ts(payment.created_at)?,
            ts(payment.updated_at)?,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

fn next_sequence(conn: &Connection) -> Result<u64, StorageError> {
    conn.execute("UPDATE sequence_counter SET value = value + 1 WHERE id = 1", [])
        .map_err(sql_err)?;
    conn.query_row("SELECT value FROM sequence_counter WHERE id = 1", [], |r| r.get(0))
        .map_err(sql_err)
}

fn exists(conn: &Connection, sql: &str, value: &str) -> Result<bool, StorageError> {
    conn.query_row(sql, params![value], |row| row.get(0)).map_err(sql_err)
}

/// Unit-of-work handle over an open SQLite transaction.
struct SqliteTx<'c> {
    conn: &'c Connection,
}

impl StoreTx for SqliteTx<'_> {
    fn account(&mut self, id: Uuid) -> Result<Account, StorageError> {
        fetch_account(self.conn, id)
    }

    fn post(&mut self, posting: &Posting) -> Result<LedgerEntry, StorageError> {
        let account = fetch_account(self.conn, posting.account_id)?;
        if account.status != AccountStatus::Active {
            return Err(StorageError::AccountInactive(account.id));
        }

        let balance_after = account.balance + posting.amount;
        if balance_after < Decimal::ZERO {
            return Err(StorageError::InsufficientFunds {
                account_id: account.id,
                balance: account.balance,
                requested: -posting.amount,
            });
        }

        self.conn
            .execute(
                "UPDATE accounts SET balance = ?1 WHERE id = ?2",
                params![balance_after.to_string(), account.id.to_string()],
            )
            .map_err(sql_err)?;

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            sequence: next_sequence(self.conn)?,
            account_id: account.id,
            kind: posting.kind,
            amount: posting.amount,
            balance_after,
            description: posting.description.clone(),
            reference: posting.reference,
            created_at: OffsetDateTime::now_utc(),
        };
        self.conn
            .execute(
                &format!(
                    "INSERT INTO ledger_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    ENTRY_COLUMNS
                ),
                params![
                    entry.id.to_string(),
                    entry.sequence,
                    entry.account_id.to_string(),
                    entry.kind.as_str(),
                    entry.amount.to_string(),
                    entry.balance_after.to_string(),
                    entry.description,
                    entry.reference.map(|r| r.to_string()),
                    ts(entry.created_at)?,
                ],
            )
            .map_err(sql_err)?;
        Ok(entry)
    }

    fn insert_transfer(&mut self, transfer: &Transfer) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO transfers (id, from_account, to_account, amount, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    transfer.id.to_string(),
                    transfer.from_account.to_string(),
                    transfer.to_account.to_string(),
                    transfer.amount.to_string(),
                    transfer.description,
                    ts(transfer.created_at)?,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn loan(&mut self, id: Uuid) -> Result<Loan, StorageError> {
        fetch_loan(self.conn, id)
    }

    fn save_loan(&mut self, loan: &Loan) -> Result<(), StorageError> {
        upsert_loan(self.conn, loan)
    }

    fn insert_investment(&mut self, investment: &Investment) -> Result<(), StorageError> {
        self.conn
            .execute(
                "INSERT INTO investments (id, user_id, account_id, product, amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    investment.id.to_string(),
                    investment.user_id.to_string(),
                    investment.account_id.to_string(),
                    investment.product,
                    investment.amount.to_string(),
                    ts(investment.created_at)?,
                ],
            )
            .map_err(sql_err)?;
        Ok(())
    }

    fn payment(&mut self, id: Uuid) -> Result<Payment, StorageError> {
        fetch_payment(self.conn, id)
    }

    fn save_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        upsert_payment(self.conn, payment)
    }

    fn idempotency_record(&mut self, user_id: Uuid, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        self.conn
            .query_row(
                "SELECT user_id, key, fingerprint, response, created_at FROM idempotency_keys
                 WHERE user_id = ?1 AND key = ?2",
                params![user_id.to_string(), key],
                |row| {
                    Ok(IdempotencyRecord {
                        user_id: parsed(row, 0)?,
                        key: row.get(1)?,
                        fingerprint: row.get(2)?,
                        response: row.get(3)?,
                        created_at: timestamp(row, 4)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)
    }

    fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO idempotency_keys (user_id, key, fingerprint, response, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.user_id.to_string(),
                    record.key,
                    record.fingerprint,
                    record.response,
                    ts(record.created_at)?,
                ],
            )
            .map_err(sql_err)?;
        if inserted == 0 {
            return Err(StorageError::AlreadyExists(format!("idempotency key {}", record.key)));
        }
        Ok(())
    }
}

impl StorageBackend for SqliteStorage {
    fn create_user(&self, user: &User) -> Result<(), StorageError> {
        let conn = self.lock()?;
        if exists(&conn, "SELECT COUNT(*) > 0 FROM users WHERE email = ?1", &user.email)? {
            return Err(StorageError::AlreadyExists(format!("email {}", user.email)));
        }
        if exists(&conn, "SELECT COUNT(*) > 0 FROM users WHERE username = ?1", &user.username)? {
            return Err(StorageError::AlreadyExists(format!("username {}", user.username)));
        }
        conn.execute(
            &format!("INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", USER_COLUMNS),
            params![
                user.id.to_string(),
                user.email,
                user.username,
                user.full_name,
                user.phone,
                user.password_hash,
                user.role.as_str(),
                ts(user.created_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn get_user(&self, id: Uuid) -> Result<User, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
            params![id.to_string()],
            user_from_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StorageError::not_found("user", id))
    }

    fn find_user_by_login(&self, login: &str) -> Result<Option<User>, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM users WHERE email = ?1 OR username = ?1", USER_COLUMNS),
            params![login],
            user_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM users ORDER BY rowid", USER_COLUMNS))
            .map_err(sql_err)?;
        let users = stmt
            .query_map([], user_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(users)
    }

    fn delete_user(&self, id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let id = id.to_string();
        tx.execute("DELETE FROM sessions WHERE user_id = ?1", params![id])
            .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM accounts WHERE user_id = ?1
             AND NOT EXISTS (SELECT 1 FROM ledger_entries WHERE account_id = accounts.id)",
            params![id],
        )
        .map_err(sql_err)?;
        tx.execute("DELETE FROM users WHERE id = ?1", params![id])
            .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.token,
                session.user_id.to_string(),
                ts(session.created_at)?,
                ts(session.expires_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn get_session(&self, token: &str) -> Result<Option<Session>, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT token, user_id, created_at, expires_at FROM sessions WHERE token = ?1",
            params![token],
            session_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    fn delete_session(&self, token: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(sql_err)?;
        Ok(())
    }

    fn delete_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        // rfc3339 text does not order reliably across offsets, so compare in Rust
        let sessions = {
            let mut stmt = conn
                .prepare("SELECT token, user_id, created_at, expires_at FROM sessions")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], session_from_row)
                .map_err(sql_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(sql_err)?;
            rows
        };
        let mut removed = 0;
        for session in sessions.iter().filter(|s| s.is_expired(now)) {
            removed += conn
                .execute("DELETE FROM sessions WHERE token = ?1", params![session.token])
                .map_err(sql_err)?;
        }
        Ok(removed)
    }

    fn save_otp(&self, challenge: &OtpChallenge) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO otp_challenges (email, code, expires_at, attempts_left) VALUES (?1, ?2, ?3, ?4)",
            params![
                challenge.email.to_lowercase(),
                challenge.code,
                ts(challenge.expires_at)?,
                challenge.attempts_left,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn take_otp(&self, email: &str) -> Result<Option<OtpChallenge>, StorageError> {
        let conn = self.lock()?;
        let email = email.to_lowercase();
        let challenge = conn
            .query_row(
                "SELECT email, code, expires_at, attempts_left FROM otp_challenges WHERE email = ?1",
                params![email],
                |row| {
                    Ok(OtpChallenge {
                        email: row.get(0)?,
                        code: row.get(1)?,
                        expires_at: timestamp(row, 2)?,
                        attempts_left: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(sql_err)?;
        if challenge.is_some() {
            conn.execute("DELETE FROM otp_challenges WHERE email = ?1", params![email])
                .map_err(sql_err)?;
        }
        Ok(challenge)
    }

    fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        let conn = self.lock()?;
        if exists(
            &conn,
            "SELECT COUNT(*) > 0 FROM accounts WHERE account_number = ?1",
            &account.account_number,
        )? {
            return Err(StorageError::AlreadyExists(format!("account number {}", account.account_number)));
        }
        conn.execute(
            &format!("INSERT INTO accounts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", ACCOUNT_COLUMNS),
            params![
                account.id.to_string(),
                account.user_id.to_string(),
                account.account_number,
                account.kind.as_str(),
                account.status.as_str(),
                account.balance.to_string(),
                ts(account.created_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn get_account(&self, id: Uuid) -> Result<Account, StorageError> {
        let conn = self.lock()?;
        fetch_account(&conn, id)
    }

    fn find_account_by_number(&self, account_number: &str) -> Result<Option<Account>, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM accounts WHERE account_number = ?1", ACCOUNT_COLUMNS),
            params![account_number],
            account_from_row,
        )
        .optional()
        .map_err(sql_err)
    }

    fn list_accounts(&self, user_id: Option<Uuid>) -> Result<Vec<Account>, StorageError> {
        let conn = self.lock()?;
        let accounts = match user_id {
            Some(user_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM accounts WHERE user_id = ?1 ORDER BY rowid",
                        ACCOUNT_COLUMNS
                    ))
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![user_id.to_string()], account_from_row)
                    .map_err(sql_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sql_err)?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {} FROM accounts ORDER BY rowid", ACCOUNT_COLUMNS))
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map([], account_from_row)
                    .map_err(sql_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sql_err)?;
                rows
            }
        };
        Ok(accounts)
    }

    fn set_account_status(&self, id: Uuid, status: AccountStatus) -> Result<Account, StorageError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE accounts SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id.to_string()],
            )
            .map_err(sql_err)?;
        if changed == 0 {
            return Err(StorageError::not_found("account", id));
        }
        tracing::debug!(account_id = %id, status = %status, "account status changed");
        fetch_account(&conn, id)
    }

    fn list_entries(&self, account_id: Uuid, page: Page) -> Result<Vec<LedgerEntry>, StorageError> {
        let conn = self.lock()?;
        fetch_account(&conn, account_id)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM ledger_entries WHERE account_id = ?1
                 ORDER BY sequence DESC LIMIT ?2 OFFSET ?3",
                ENTRY_COLUMNS
            ))
            .map_err(sql_err)?;
        let entries = stmt
            .query_map(
                params![account_id.to_string(), sql_int(page.limit), sql_int(page.offset)],
                entry_from_row,
            )
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(entries)
    }

    fn list_transfers(&self, account_ids: &[Uuid], page: Page) -> Result<Vec<Transfer>, StorageError> {
        if account_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; account_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, from_account, to_account, amount, description, created_at FROM transfers
             WHERE from_account IN ({p}) OR to_account IN ({p})
             ORDER BY rowid DESC LIMIT ? OFFSET ?",
            p = placeholders
        );

        let ids = account_ids.iter().map(|id| Value::Text(id.to_string()));
        let values: Vec<Value> = ids
            .clone()
            .chain(ids)
            .chain([Value::Integer(sql_int(page.limit)), Value::Integer(sql_int(page.offset))])
            .collect();

        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let transfers = stmt
            .query_map(params_from_iter(values.iter()), transfer_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(transfers)
    }

    fn create_card(&self, card: &Card) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO cards ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                CARD_COLUMNS
            ),
            params![
                card.id.to_string(),
                card.user_id.to_string(),
                card.account_id.to_string(),
                card.kind.as_str(),
                card.masked_number,
                card.last4,
                card.holder_name,
                card.expiry_month,
                card.expiry_year,
                card.status.as_str(),
                ts(card.created_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn get_card(&self, id: Uuid) -> Result<Card, StorageError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM cards WHERE id = ?1", CARD_COLUMNS),
            params![id.to_string()],
            card_from_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StorageError::not_found("card", id))
    }

    fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM cards WHERE user_id = ?1 ORDER BY rowid", CARD_COLUMNS))
            .map_err(sql_err)?;
        let cards = stmt
            .query_map(params![user_id.to_string()], card_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(cards)
    }

    fn set_card_status(&self, id: Uuid, status: CardStatus) -> Result<Card, StorageError> {
        {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE cards SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id.to_string()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(StorageError::not_found("card", id));
            }
        }
        self.get_card(id)
    }

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let conn = self.lock()?;
        upsert_loan(&conn, loan)
    }

    fn get_loan(&self, id: Uuid) -> Result<Loan, StorageError> {
        let conn = self.lock()?;
        fetch_loan(&conn, id)
    }

    fn list_loans(&self, user_id: Option<Uuid>) -> Result<Vec<Loan>, StorageError> {
        let conn = self.lock()?;
        let filter = user_id.map(|u| u.to_string());
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM loans WHERE ?1 IS NULL OR user_id = ?1 ORDER BY rowid DESC",
                LOAN_COLUMNS
            ))
            .map_err(sql_err)?;
        let loans = stmt
            .query_map(params![filter], loan_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(loans)
    }

    fn list_investments(&self, user_id: Uuid) -> Result<Vec<Investment>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, account_id, product, amount, created_at FROM investments
                 WHERE user_id = ?1 ORDER BY rowid DESC",
            )
            .map_err(sql_err)?;
        let investments = stmt
            .query_map(params![user_id.to_string()], investment_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(investments)
    }

    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        let conn = self.lock()?;
        upsert_payment(&conn, payment)
    }

    fn get_payment(&self, id: Uuid) -> Result<Payment, StorageError> {
        let conn = self.lock()?;
        fetch_payment(&conn, id)
    }

    fn list_payments(&self, user_id: Uuid) -> Result<Vec<Payment>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM payments WHERE user_id = ?1 ORDER BY rowid DESC",
                PAYMENT_COLUMNS
            ))
            .map_err(sql_err)?;
        let payments = stmt
            .query_map(params![user_id.to_string()], payment_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(payments)
    }

    fn list_payments_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM payments WHERE status = ?1", PAYMENT_COLUMNS))
            .map_err(sql_err)?;
        let mut payments = stmt
            .query_map(params![status.as_str()], payment_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    fn create_expenditure(&self, expenditure: &Expenditure) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO expenditures (id, user_id, category, amount, note, spent_on, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                expenditure.id.to_string(),
                expenditure.user_id.to_string(),
                expenditure.category,
                expenditure.amount.to_string(),
                expenditure.note,
                date_to_str(expenditure.spent_on),
                ts(expenditure.created_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn list_expenditures(&self, user_id: Uuid) -> Result<Vec<Expenditure>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, category, amount, note, spent_on, created_at FROM expenditures
                 WHERE user_id = ?1 ORDER BY rowid DESC",
            )
            .map_err(sql_err)?;
        let expenditures = stmt
            .query_map(params![user_id.to_string()], expenditure_from_row)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(expenditures)
    }

    fn atomically(&self, work: &mut UnitOfWork<'_>) -> Result<(), StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        let outcome = work(&mut SqliteTx { conn: &tx });
        match outcome {
            Ok(()) => {
                tx.commit().map_err(sql_err)?;
                tracing::debug!(tx_id, "Unit of work committed");
                Ok(())
            }
            Err(e) => {
                tx.rollback().map_err(sql_err)?;
                tracing::debug!(tx_id, error = %e, "Unit of work rolled back");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bankd_core::{AccountKind, LoanStatus, Role, TransactionKind};

    fn user(email: &str, username: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            username: username.to_string(),
            full_name: "Test User".to_string(),
            phone: Some("+15550100".to_string()),
            password_hash: "hash".to_string(),
            role: Role::Customer,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn deposit(storage: &SqliteStorage, account_id: Uuid, amount: i64) -> Result<(), StorageError> {
        storage.atomically(&mut |tx: &mut dyn StoreTx| {
            tx.post(&Posting::credit(account_id, Decimal::from(amount), TransactionKind::Deposit, "cash"))?;
            Ok(())
        })
    }

    #[test]
    fn test_sqlite_user_round_trip() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let alice = user("Alice@Example.com", "alice");
        storage.create_user(&alice).unwrap();

        let found = storage.find_user_by_login("alice@example.com").unwrap().unwrap();
        assert_eq!(found, alice);
        assert_eq!(storage.get_user(alice.id).unwrap().password_hash, "hash");

        let clash = storage.create_user(&user("alice@example.com", "other"));
        assert!(matches!(clash, Err(StorageError::AlreadyExists(_))));
        let clash = storage.create_user(&user("other@example.com", "ALICE"));
        assert!(matches!(clash, Err(StorageError::AlreadyExists(_))));
    }

    #[test]
    fn test_sqlite_posting_and_entries() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = Account::open(Uuid::new_v4(), "200000000001".to_string(), AccountKind::Checking);
        storage.create_account(&account).unwrap();

        deposit(&storage, account.id, 100).unwrap();
        deposit(&storage, account.id, 25).unwrap();

        assert_eq!(storage.get_account(account.id).unwrap().balance, Decimal::from(125));
        let entries = storage.list_entries(account.id, Page::default()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].sequence > entries[1].sequence);
        assert_eq!(entries[0].balance_after, Decimal::from(125));

        let page = storage.list_entries(account.id, Page::new(Some(1), Some(1))).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].amount, Decimal::from(100));
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let from = Account::open(Uuid::new_v4(), "200000000002".to_string(), AccountKind::Checking);
        let to = Account::open(Uuid::new_v4(), "200000000003".to_string(), AccountKind::Checking);
        storage.create_account(&from).unwrap();
        storage.create_account(&to).unwrap();
        deposit(&storage, from.id, 50).unwrap();

        let result = storage.atomically(&mut |tx: &mut dyn StoreTx| {
            tx.post(&Posting::credit(to.id, Decimal::from(80), TransactionKind::TransferIn, "in"))?;
            tx.post(&Posting::debit(from.id, Decimal::from(80), TransactionKind::TransferOut, "out"))?;
            Ok(())
        });
        assert!(matches!(result, Err(StorageError::InsufficientFunds { .. })));

        assert_eq!(storage.get_account(to.id).unwrap().balance, Decimal::ZERO);
        assert!(storage.list_entries(to.id, Page::default()).unwrap().is_empty());
        assert_eq!(storage.get_account(from.id).unwrap().balance, Decimal::from(50));
    }

    #[test]
    fn test_sqlite_loan_updates_in_unit() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let account = Account::open(Uuid::new_v4(), "200000000004".to_string(), AccountKind::Checking);
        storage.create_account(&account).unwrap();

        let mut loan = Loan {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            account_id: account.id,
            principal: Decimal::from(1200),
            annual_rate: Decimal::ZERO,
            term_months: 12,
            monthly_installment: Decimal::from(100),
            outstanding: Decimal::from(1200),
            purpose: "car".to_string(),
            status: LoanStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            decided_at: None,
        };
        storage.create_loan(&loan).unwrap();

        storage
            .atomically(&mut |tx: &mut dyn StoreTx| {
                let mut current = tx.loan(loan.id)?;
                current.status = LoanStatus::Active;
                current.decided_at = Some(OffsetDateTime::now_utc());
                tx.post(&Posting::credit(current.account_id, current.principal, TransactionKind::LoanDisbursement, "loan"))?;
                tx.save_loan(&current)
            })
            .unwrap();

        loan = storage.get_loan(loan.id).unwrap();
        assert_eq!(loan.status, LoanStatus::Active);
        assert!(loan.decided_at.is_some());
        assert_eq!(storage.get_account(account.id).unwrap().balance, Decimal::from(1200));
    }

    #[test]
    fn test_sqlite_data_survives_reopen() {
        let path = std::env::temp_dir().join(format!("bankd-{}.db", Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();
        let account = Account::open(Uuid::new_v4(), "200000000005".to_string(), AccountKind::Savings);
        {
            let storage = SqliteStorage::new(&path_str).unwrap();
            storage.create_account(&account).unwrap();
            deposit(&storage, account.id, 42).unwrap();
        }
        let storage = SqliteStorage::new(&path_str).unwrap();
        assert_eq!(storage.get_account(account.id).unwrap().balance, Decimal::from(42));
        assert_eq!(storage.list_entries(account.id, Page::default()).unwrap().len(), 1);
        drop(storage);
        let _ = std::fs::remove_file(&path);
    }
}
