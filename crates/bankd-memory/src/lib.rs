//! In-memory storage backend for bankd.
//!
//! Units of work run against a clone of the books taken under the write lock;
//! the clone replaces the live books only when the unit succeeds.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

use bankd_core::{
    Account, AccountStatus, Card, CardStatus, Expenditure, IdempotencyRecord, Investment,
    LedgerEntry, Loan, OtpChallenge, Page, Payment, PaymentStatus, Posting, Session, StorageBackend,
    StorageError, StoreTx, Transfer, UnitOfWork, User,
};

fn poisoned<T>(_: PoisonError<T>) -> StorageError {
    StorageError::Other("storage lock poisoned".to_string())
}

fn paginate<T: Clone>(items: impl DoubleEndedIterator<Item = T>, page: Page) -> Vec<T> {
    items.rev().skip(page.offset).take(page.limit).collect()
}

#[derive(Clone, Default)]
struct Directory {
    users: BTreeMap<Uuid, User>,
    sessions: HashMap<String, Session>,
    otps: HashMap<String, OtpChallenge>,
    cards: BTreeMap<Uuid, Card>,
    expenditures: Vec<Expenditure>,
}

/// Everything a unit of work may touch.
#[derive(Clone, Default)]
struct Books {
    accounts: BTreeMap<Uuid, Account>,
    ledger: BTreeMap<Uuid, Vec<LedgerEntry>>,
    transfers: Vec<Transfer>,
    loans: BTreeMap<Uuid, Loan>,
    investments: Vec<Investment>,
    payments: BTreeMap<Uuid, Payment>,
    idempotency: HashMap<(Uuid, String), IdempotencyRecord>,
    sequence: u64,
}

pub struct InMemoryStorage {
    directory: RwLock<Directory>,
    books: RwLock<Books>,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            directory: RwLock::new(Directory::default()),
            books: RwLock::new(Books::default()),
            tx_counter: AtomicU64::new(1),
        }
    }
}

impl StoreTx for Books {
    fn account(&mut self, id: Uuid) -> Result<Account, StorageError> {
        self.accounts
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("account", id))
    }

    fn post(&mut self, posting: &Posting) -> Result<LedgerEntry, StorageError> {
        let account = self
            .accounts
            .get_mut(&posting.account_id)
            .ok_or_else(|| StorageError::not_found("account", posting.account_id))?;
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
        account.balance = balance_after;

        self.sequence += 1;
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            sequence: self.sequence,
            account_id: posting.account_id,
            kind: posting.kind,
            amount: posting.amount,
            balance_after,
            description: posting.description.clone(),
            reference: posting.reference,
            created_at: OffsetDateTime::now_utc(),
        };
        self.ledger.entry(posting.account_id).or_default().push(entry.clone());
        Ok(entry)
    }

    fn insert_transfer(&mut self, transfer: &Transfer) -> Result<(), StorageError> {
        self.transfers.push(transfer.clone());
        Ok(())
    }

    fn loan(&mut self, id: Uuid) -> Result<Loan, StorageError> {
        self.loans.get(&id).cloned().ok_or_else(|| StorageError::not_found("loan", id))
    }

    fn save_loan(&mut self, loan: &Loan) -> Result<(), StorageError> {
        self.loans.insert(loan.id, loan.clone());
        Ok(())
    }

    fn insert_investment(&mut self, investment: &Investment) -> Result<(), StorageError> {
        self.investments.push(investment.clone());
        Ok(())
    }

    fn payment(&mut self, id: Uuid) -> Result<Payment, StorageError> {
        self.payments.get(&id).cloned().ok_or_else(|| StorageError::not_found("payment", id))
    }

    fn save_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        self.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    fn idempotency_record(&mut self, user_id: Uuid, key: &str) -> Result<Option<IdempotencyRecord>, StorageError> {
        Ok(self.idempotency.get(&(user_id, key.to_string())).cloned())
    }

    fn save_idempotency_record(&mut self, record: &IdempotencyRecord) -> Result<(), StorageError> {
        let slot = (record.user_id, record.key.clone());
        if self.idempotency.contains_key(&slot) {
            return Err(StorageError::AlreadyExists(format!("idempotency key {}", record.key)));
        }
        self.idempotency.insert(slot, record.clone());
        Ok(())
    }
}

impl StorageBackend for InMemoryStorage {
    fn create_user(&self, user: &User) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        for existing in directory.users.values() {
            if existing.email.eq_ignore_ascii_case(&user.email) {
                return Err(StorageError::AlreadyExists(format!("email {}", user.email)));
            }
            if existing.username.eq_ignore_ascii_case(&user.username) {
                return Err(StorageError::AlreadyExists(format!("username {}", user.username)));
            }
        }
        directory.users.insert(user.id, user.clone());
        Ok(())
    }

    fn get_user(&self, id: Uuid) -> Result<User, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        directory.users.get(&id).cloned().ok_or_else(|| StorageError::not_found("user", id))
    }

    fn find_user_by_login(&self, login: &str) -> Result<Option<User>, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        Ok(directory
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(login) || u.username.eq_ignore_ascii_case(login))
            .cloned())
    }

    fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        let mut users: Vec<User> = directory.users.values().cloned().collect();
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    fn delete_user(&self, id: Uuid) -> Result<(), StorageError> {
        {
            let mut books = self.books.write().map_err(poisoned)?;
            let Books { accounts, ledger, .. } = &mut *books;
            accounts.retain(|account_id, account| {
                account.user_id != id || ledger.get(account_id).map_or(false, |entries| !entries.is_empty())
            });
        }
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.sessions.retain(|_, s| s.user_id != id);
        directory.users.remove(&id);
        Ok(())
    }

    fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    fn get_session(&self, token: &str) -> Result<Option<Session>, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        Ok(directory.sessions.get(token).cloned())
    }

    fn delete_session(&self, token: &str) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.sessions.remove(token);
        Ok(())
    }

    fn delete_expired_sessions(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        let before = directory.sessions.len();
        directory.sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - directory.sessions.len())
    }

    fn save_otp(&self, challenge: &OtpChallenge) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.otps.insert(challenge.email.to_lowercase(), challenge.clone());
        Ok(())
    }

    fn take_otp(&self, email: &str) -> Result<Option<OtpChallenge>, StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        Ok(directory.otps.remove(&email.to_lowercase()))
    }

    fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        let mut books = self.books.write().map_err(poisoned)?;
        if books.accounts.values().any(|a| a.account_number == account.account_number) {
            return Err(StorageError::AlreadyExists(format!("account number {}", account.account_number)));
        }
        books.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn get_account(&self, id: Uuid) -> Result<Account, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        books.accounts.get(&id).cloned().ok_or_else(|| StorageError::not_found("account", id))
    }

    fn find_account_by_number(&self, account_number: &str) -> Result<Option<Account>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        Ok(books.accounts.values().find(|a| a.account_number == account_number).cloned())
    }

    fn list_accounts(&self, user_id: Option<Uuid>) -> Result<Vec<Account>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        let mut accounts: Vec<Account> = books
            .accounts
            .values()
            .filter(|a| user_id.map_or(true, |u| a.user_id == u))
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    fn set_account_status(&self, id: Uuid, status: AccountStatus) -> Result<Account, StorageError> {
        let mut books = self.books.write().map_err(poisoned)?;
        let account = books.accounts.get_mut(&id).ok_or_else(|| StorageError::not_found("account", id))?;
        account.status = status;
        tracing::debug!(account_id = %id, status = %status, "account status changed");
        Ok(account.clone())
    }

    fn list_entries(&self, account_id: Uuid, page: Page) -> Result<Vec<LedgerEntry>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        if !books.accounts.contains_key(&account_id) {
            return Err(StorageError::not_found("account", account_id));
        }
        Ok(match books.ledger.get(&account_id) {
            Some(entries) => paginate(entries.iter().cloned(), page),
            None => Vec::new(),
        })
    }

    fn list_transfers(&self, account_ids: &[Uuid], page: Page) -> Result<Vec<Transfer>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        let matching: Vec<Transfer> = books
            .transfers
            .iter()
            .filter(|t| account_ids.contains(&t.from_account) || account_ids.contains(&t.to_account))
            .cloned()
            .collect();
        Ok(paginate(matching.into_iter(), page))
    }

    fn create_card(&self, card: &Card) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.cards.insert(card.id, card.clone());
        Ok(())
    }

    fn get_card(&self, id: Uuid) -> Result<Card, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        directory.cards.get(&id).cloned().ok_or_else(|| StorageError::not_found("card", id))
    }

    fn list_cards(&self, user_id: Uuid) -> Result<Vec<Card>, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        let mut cards: Vec<Card> = directory.cards.values().filter(|c| c.user_id == user_id).cloned().collect();
        cards.sort_by_key(|c| c.created_at);
        Ok(cards)
    }

    fn set_card_status(&self, id: Uuid, status: CardStatus) -> Result<Card, StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        let card = directory.cards.get_mut(&id).ok_or_else(|| StorageError::not_found("card", id))?;
        card.status = status;
        Ok(card.clone())
    }

    fn create_loan(&self, loan: &Loan) -> Result<(), StorageError> {
        let mut books = self.books.write().map_err(poisoned)?;
        books.loans.insert(loan.id, loan.clone());
        Ok(())
    }

    fn get_loan(&self, id: Uuid) -> Result<Loan, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        books.loans.get(&id).cloned().ok_or_else(|| StorageError::not_found("loan", id))
    }

    fn list_loans(&self, user_id: Option<Uuid>) -> Result<Vec<Loan>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        let mut loans: Vec<Loan> = books
            .loans
            .values()
            .filter(|l| user_id.map_or(true, |u| l.user_id == u))
            .cloned()
            .collect();
        loans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(loans)
    }

    fn list_investments(&self, user_id: Uuid) -> Result<Vec<Investment>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        Ok(books.investments.iter().rev().filter(|i| i.user_id == user_id).cloned().collect())
    }

    fn create_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        let mut books = self.books.write().map_err(poisoned)?;
        books.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    fn get_payment(&self, id: Uuid) -> Result<Payment, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        books.payments.get(&id).cloned().ok_or_else(|| StorageError::not_found("payment", id))
    }

    fn list_payments(&self, user_id: Uuid) -> Result<Vec<Payment>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        let mut payments: Vec<Payment> = books.payments.values().filter(|p| p.user_id == user_id).cloned().collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }

    fn list_payments_by_status(&self, status: PaymentStatus) -> Result<Vec<Payment>, StorageError> {
        let books = self.books.read().map_err(poisoned)?;
        let mut payments: Vec<Payment> = books.payments.values().filter(|p| p.status == status).cloned().collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    fn create_expenditure(&self, expenditure: &Expenditure) -> Result<(), StorageError> {
        let mut directory = self.directory.write().map_err(poisoned)?;
        directory.expenditures.push(expenditure.clone());
        Ok(())
    }

    fn list_expenditures(&self, user_id: Uuid) -> Result<Vec<Expenditure>, StorageError> {
        let directory = self.directory.read().map_err(poisoned)?;
        Ok(directory.expenditures.iter().rev().filter(|e| e.user_id == user_id).cloned().collect())
    }

    fn atomically(&self, work: &mut UnitOfWork<'_>) -> Result<(), StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let mut books = self.books.write().map_err(poisoned)?;
        let mut draft = books.clone();
        match work(&mut draft) {
            Ok(()) => {
                *books = draft;
                tracing::debug!(tx_id, "Unit of work committed");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(tx_id, error = %e, "Unit of work rolled back");
                Err(e)
            }
        }
    }
}
