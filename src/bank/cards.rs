use bankd_core::{luhn_check_digit, mask_card_number, Card, CardKind, CardStatus, StorageError};
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::Bank;
use crate::{auth::CallerIdentity, error::BankError};

const CARD_VALIDITY_YEARS: i32 = 4;

/// A freshly issued card. `number` is shown once and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedCard {
    pub card: Card,
    pub number: String,
}

fn generate_card_number(kind: CardKind) -> Result<String, BankError> {
    let prefix = match kind {
        CardKind::Debit => '4',
        CardKind::Credit => '5',
    };
    let mut rng = rand::thread_rng();
    let mut payload = String::with_capacity(16);
    payload.push(prefix);
    payload.extend((0..14).map(|_| char::from(b'0' + rng.gen_range(0..10u8))));
    let check = luhn_check_digit(&payload)
        .ok_or_else(|| BankError::Internal("card payload is not numeric".to_string()))?;
    payload.push(char::from(b'0' + check));
    Ok(payload)
}

impl Bank {
    pub fn issue_card(&self, caller: &CallerIdentity, account_id: Uuid, kind: CardKind) -> Result<IssuedCard, BankError> {
        let user_id = caller.require_user()?;
        let account = self.accessible_account(caller, account_id)?;
        if !account.is_active() {
            return Err(StorageError::AccountInactive(account.id).into());
        }
        let holder = self.storage.get_user(user_id)?;

        let number = generate_card_number(kind)?;
        let now = OffsetDateTime::now_utc();
        let card = Card {
            id: Uuid::new_v4(),
            user_id,
            account_id: account.id,
            kind,
            masked_number: mask_card_number(&number),
            last4: number[number.len() - 4..].to_string(),
            holder_name: holder.full_name.to_uppercase(),
            expiry_month: now.month() as u8,
            expiry_year: now.year() + CARD_VALIDITY_YEARS,
            status: CardStatus::Active,
            created_at: now,
        };
        self.storage.create_card(&card)?;
        tracing::info!(card_id = %card.id, account_id = %account.id, kind = %kind, "Card issued");
        Ok(IssuedCard { card, number })
    }

    pub fn list_cards(&self, caller: &CallerIdentity) -> Result<Vec<Card>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_cards(user_id)?)
    }

    pub fn set_card_status(&self, caller: &CallerIdentity, card_id: Uuid, status: CardStatus) -> Result<Card, BankError> {
        let card = self.storage.get_card(card_id)?;
        if !caller.can_access(card.user_id) {
            return Err(StorageError::not_found("card", card_id).into());
        }
        let card = self.storage.set_card_status(card_id, status)?;
        tracing::info!(card_id = %card_id, status = %status, "Card status changed");
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::testing::{bank, customer};

    fn luhn_valid(number: &str) -> bool {
        let (payload, check) = number.split_at(number.len() - 1);
        luhn_check_digit(payload).map(|d| d.to_string()) == Some(check.to_string())
    }

    #[test]
    fn test_generated_numbers_pass_luhn() {
        for _ in 0..20 {
            let debit = generate_card_number(CardKind::Debit).unwrap();
            let credit = generate_card_number(CardKind::Credit).unwrap();
            assert_eq!(debit.len(), 16);
            assert!(debit.starts_with('4') && luhn_valid(&debit));
            assert!(credit.starts_with('5') && luhn_valid(&credit));
        }
    }

    #[test]
    fn test_issue_block_and_unblock() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 0);
        let issued = bank.issue_card(&alice, account.id, CardKind::Debit).unwrap();

        assert!(issued.card.masked_number.ends_with(&issued.card.last4));
        assert!(!issued.card.masked_number.contains(&issued.number));
        assert_eq!(issued.card.expiry_year, OffsetDateTime::now_utc().year() + 4);

        let blocked = bank.set_card_status(&alice, issued.card.id, CardStatus::Blocked).unwrap();
        assert_eq!(blocked.status, CardStatus::Blocked);
        let active = bank.set_card_status(&alice, issued.card.id, CardStatus::Active).unwrap();
        assert_eq!(active.status, CardStatus::Active);
        assert_eq!(bank.list_cards(&alice).unwrap().len(), 1);
    }

    #[test]
    fn test_cannot_block_someone_elses_card() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 0);
        let (bob, _) = customer(&bank, "bob", 0);
        let issued = bank.issue_card(&alice, account.id, CardKind::Credit).unwrap();

        let err = bank.set_card_status(&bob, issued.card.id, CardStatus::Blocked).unwrap_err();
        assert!(matches!(err, BankError::Storage(StorageError::NotFound { .. })));
    }
}
