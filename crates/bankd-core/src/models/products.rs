use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{string_enum, ParseEnumError};

string_enum!(CardKind, "card kind" {
    Debit => "DEBIT",
    Credit => "CREDIT",
});

string_enum!(CardStatus, "card status" {
    Active => "ACTIVE",
    Blocked => "BLOCKED",
});

string_enum!(LoanStatus, "loan status" {
    Pending => "PENDING",
    Active => "ACTIVE",
    Rejected => "REJECTED",
    Repaid => "REPAID",
});

string_enum!(PaymentStatus, "payment status" {
    Processing => "PROCESSING",
    Success => "SUCCESS",
    Failed => "FAILED",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub kind: CardKind,
    pub masked_number: String,
    pub last4: String,
    pub holder_name: String,
    pub expiry_month: u8,
    pub expiry_year: i32,
    pub status: CardStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Computes the Luhn check digit for a string of decimal digits.
pub fn luhn_check_digit(payload: &str) -> Option<u8> {
    let mut sum = 0u32;
    for (i, c) in payload.chars().rev().enumerate() {
        let mut d = c.to_digit(10)?;
        // the check digit will sit to the right, so the rightmost payload digit is doubled
        if i % 2 == 0 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    Some(((10 - (sum % 10)) % 10) as u8)
}

pub fn mask_card_number(number: &str) -> String {
    let last4 = &number[number.len().saturating_sub(4)..];
    format!("**** **** **** {}", last4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub principal: Decimal,
    pub annual_rate: Decimal,
    pub term_months: u32,
    pub monthly_installment: Decimal,
    pub outstanding: Decimal,
    pub purpose: String,
    pub status: LoanStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<OffsetDateTime>,
}

impl Loan {
    /// Fixed monthly installment of a fully amortizing loan, rounded to cents.
    /// `None` when the compounding exceeds the range of `Decimal`.
    pub fn amortized_installment(principal: Decimal, annual_rate: Decimal, term_months: u32) -> Option<Decimal> {
        if term_months == 0 {
            return Some(principal);
        }
        let n = Decimal::from(term_months);
        let r = annual_rate / Decimal::from(12);
        let installment = if r.is_zero() {
            principal / n
        } else {
            let factor = (Decimal::ONE + r).checked_powi(i64::from(term_months))?;
            principal
                .checked_mul(r)?
                .checked_mul(factor)?
                .checked_div(factor - Decimal::ONE)?
        };
        Some(installment.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn total_repayable(&self) -> Decimal {
        self.monthly_installment * Decimal::from(self.term_months)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub product: String,
    pub amount: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_id: Uuid,
    pub payee: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expenditure {
    pub id: Uuid,
    pub user_id: Uuid,
    pub category: String,
    pub amount: Decimal,
    pub note: String,
    pub spent_on: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn_check_digit() {
        // 7992739871 is the textbook example, check digit 3
        assert_eq!(luhn_check_digit("7992739871"), Some(3));
        assert_eq!(luhn_check_digit("424242424242424"), Some(2));
        assert_eq!(luhn_check_digit("12a4"), None);
    }

    #[test]
    fn test_mask_card_number() {
        assert_eq!(mask_card_number("4242424242424242"), "**** **** **** 4242");
    }

    #[test]
    fn test_amortized_installment() {
        let installment = Loan::amortized_installment(Decimal::from(12_000), Decimal::new(6, 2), 12);
        assert_eq!(installment, Some(Decimal::new(103_280, 2)));
    }

    #[test]
    fn test_zero_rate_installment_is_linear() {
        let installment = Loan::amortized_installment(Decimal::from(1_200), Decimal::ZERO, 12);
        assert_eq!(installment, Some(Decimal::from(100)));
    }

    #[test]
    fn test_runaway_compounding_has_no_installment() {
        // 25% a month over 30 years
        let installment = Loan::amortized_installment(Decimal::from(10_000), Decimal::from(3), 360);
        assert_eq!(installment, None);
    }
}
