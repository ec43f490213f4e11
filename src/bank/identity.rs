use base64::Engine;
use bankd_core::{Account, AccountKind, OtpChallenge, Role, Session, StorageError, User};
use rand::{Rng, RngCore};
use serde::Serialize;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use super::Bank;
use crate::{auth::CallerIdentity, config::BootstrapAdmin, error::BankError, password, validation};

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub full_name: String,
    pub password: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub user: User,
    pub account: Account,
    pub session: Session,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignIn {
    pub user: User,
    pub session: Session,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtpRequested {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_otp() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

impl Bank {
    /// Creates a customer with a checking account and signs them in.
    pub async fn register(&self, input: NewUser) -> Result<Registration, BankError> {
        let email = validation::email(&input.email)?;
        let username = validation::username(&input.username)?;
        let full_name = validation::required("full_name", &input.full_name)?;
        validation::password(&input.password)?;
        let phone = match input.phone.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Some(validation::required("phone", p)?),
            _ => None,
        };

        let password_hash = password::hash_password_blocking(input.password).await?;
        let user = User {
            id: Uuid::new_v4(),
            email,
            username,
            full_name,
            phone,
            password_hash,
            role: Role::Customer,
            created_at: OffsetDateTime::now_utc(),
        };
        self.storage.create_user(&user)?;
        let opened = self
            .open_account_for(user.id, AccountKind::Checking)
            .and_then(|account| Ok((account, self.issue_session(user.id)?)));
        let (account, session) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                tracing::warn!(user_id = %user.id, error = %e, "Registration incomplete, removing user");
                if let Err(cleanup) = self.storage.delete_user(user.id) {
                    tracing::error!(user_id = %user.id, error = %cleanup, "Failed to remove incomplete user");
                }
                return Err(e);
            }
        };
        tracing::info!(user_id = %user.id, username = %user.username, "User registered");

        Ok(Registration { user, account, session })
    }

    /// Signs in with an email address or username.
    pub async fn login(&self, login: &str, password: &str) -> Result<SignIn, BankError> {
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(BankError::validation("login and password are required"));
        }
        let user = match self.storage.find_user_by_login(login)? {
            Some(user) => user,
            None => {
                password::verify_dummy_blocking(password.to_string()).await?;
                tracing::info!("Login for unknown user");
                return Err(BankError::InvalidCredentials);
            }
        };
        let matches = password::verify_password_blocking(password.to_string(), user.password_hash.clone()).await?;
        if !matches {
            tracing::info!(user_id = %user.id, "Login with wrong password");
            return Err(BankError::InvalidCredentials);
        }

        let session = self.issue_session(user.id)?;
        tracing::info!(user_id = %user.id, "User signed in");
        Ok(SignIn { user, session })
    }

    pub fn logout(&self, token: &str) -> Result<(), BankError> {
        self.storage.delete_session(token)?;
        Ok(())
    }

    /// Reports `sent` whether or not the address is registered.
    pub fn request_otp(&self, email: &str) -> Result<OtpRequested, BankError> {
        let email = validation::email(email)?;
        if self.storage.find_user_by_login(&email)?.is_none() {
            return Ok(OtpRequested { sent: true, code: None });
        }

        let code = generate_otp();
        self.storage.save_otp(&OtpChallenge {
            email: email.clone(),
            code: code.clone(),
            expires_at: OffsetDateTime::now_utc() + self.settings.otp_ttl,
            attempts_left: self.settings.otp_max_attempts,
        })?;
        tracing::debug!(email = %email, code = %code, "One-time code issued");

        Ok(OtpRequested {
            sent: true,
            code: self.settings.echo_otp.then_some(code),
        })
    }

    pub fn verify_otp(&self, email: &str, code: &str) -> Result<SignIn, BankError> {
        let email = validation::email(email)?;
        let mut challenge = self.storage.take_otp(&email)?.ok_or(BankError::InvalidCredentials)?;
        if challenge.expires_at <= OffsetDateTime::now_utc() {
            return Err(BankError::InvalidCredentials);
        }

        let matches: bool = challenge.code.as_bytes().ct_eq(code.trim().as_bytes()).into();
        if !matches {
            challenge.attempts_left = challenge.attempts_left.saturating_sub(1);
            if challenge.attempts_left > 0 {
                self.storage.save_otp(&challenge)?;
            }
            tracing::info!(email = %email, attempts_left = challenge.attempts_left, "Wrong one-time code");
            return Err(BankError::InvalidCredentials);
        }

        let user = self
            .storage
            .find_user_by_login(&email)?
            .ok_or(BankError::InvalidCredentials)?;
        let session = self.issue_session(user.id)?;
        tracing::info!(user_id = %user.id, "User signed in with one-time code");
        Ok(SignIn { user, session })
    }

    /// Resolves a session token. Expired sessions are removed.
    pub fn resolve_session(&self, token: &str) -> Result<(User, Session), BankError> {
        let session = self
            .storage
            .get_session(token)?
            .ok_or_else(|| BankError::Unauthorized("invalid or expired session".to_string()))?;
        if session.is_expired(OffsetDateTime::now_utc()) {
            self.storage.delete_session(token)?;
            return Err(BankError::Unauthorized("invalid or expired session".to_string()));
        }
        let user = match self.storage.get_user(session.user_id) {
            Ok(user) => user,
            Err(StorageError::NotFound { .. }) => {
                return Err(BankError::Unauthorized("invalid or expired session".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok((user, session))
    }

    /// Profile of the signed-in user; `None` for service keys.
    pub fn current_user(&self, caller: &CallerIdentity) -> Result<Option<User>, BankError> {
        match caller.user_id {
            Some(id) => Ok(Some(self.storage.get_user(id)?)),
            None => Ok(None),
        }
    }

    pub fn purge_expired_sessions(&self) -> Result<usize, BankError> {
        Ok(self.storage.delete_expired_sessions(OffsetDateTime::now_utc())?)
    }

    /// Creates the configured admin unless a user with that email exists.
    pub async fn bootstrap_admin(&self, admin: &BootstrapAdmin) -> Result<(), BankError> {
        let email = validation::email(&admin.email)?;
        if self.storage.find_user_by_login(&email)?.is_some() {
            tracing::debug!(email = %email, "Bootstrap admin already present");
            return Ok(());
        }
        let username = validation::username(&admin.username)?;
        validation::password(&admin.password)?;

        let user = User {
            id: Uuid::new_v4(),
            email,
            username,
            full_name: validation::required("full_name", &admin.full_name)?,
            phone: None,
            password_hash: password::hash_password_blocking(admin.password.clone()).await?,
            role: Role::Admin,
            created_at: OffsetDateTime::now_utc(),
        };
        self.storage.create_user(&user)?;
        tracing::info!(user_id = %user.id, username = %user.username, "Bootstrap admin created");
        Ok(())
    }

    fn issue_session(&self, user_id: Uuid) -> Result<Session, BankError> {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            token: generate_session_token(),
            user_id,
            created_at: now,
            expires_at: now + self.settings.session_ttl,
        };
        self.storage.create_session(&session)?;
        Ok(session)
    }
}
