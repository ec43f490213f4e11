//! Argon2id password hashing.

use std::sync::OnceLock;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

use crate::error::BankError;

/// Hash a plaintext password with Argon2id using a random salt.
pub fn hash_password(password: &str) -> Result<String, BankError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| BankError::Internal(format!("failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

/// Returns `Ok(false)` on a mismatch and an error only for an unreadable hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, BankError> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| BankError::Internal(format!("invalid password hash: {}", e)))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Runs a verification against a fixed hash so a missing account costs as
/// much as a wrong password. Always `false`.
pub fn verify_dummy(password: &str) -> bool {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();
    if let Some(hash) = DUMMY_HASH.get_or_init(|| hash_password("bankd-no-such-user").ok()) {
        let _ = verify_password(password, hash);
    }
    false
}

pub async fn hash_password_blocking(password: String) -> Result<String, BankError> {
    tokio::task::spawn_blocking(move || hash_password(&password)).await?
}

pub async fn verify_password_blocking(password: String, hash: String) -> Result<bool, BankError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await?
}

pub async fn verify_dummy_blocking(password: String) -> Result<bool, BankError> {
    Ok(tokio::task::spawn_blocking(move || verify_dummy(&password)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(verify_password("anything", "not-a-hash").is_err());
    }

    #[test]
    fn test_dummy_verification_never_matches() {
        assert!(!verify_dummy("bankd-no-such-user"));
        assert!(!verify_dummy("anything"));
    }
}
