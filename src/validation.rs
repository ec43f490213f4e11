//! Input shape checks shared by the banking services.

use rust_decimal::Decimal;

use crate::error::BankError;

pub const MAX_TEXT_LEN: usize = 200;

/// A positive amount with at most two fractional digits, no larger than `max`.
pub fn amount(value: Decimal, max: Decimal) -> Result<Decimal, BankError> {
    if value <= Decimal::ZERO {
        return Err(BankError::validation("amount must be greater than zero"));
    }
    let value = value.normalize();
    if value.scale() > 2 {
        return Err(BankError::validation("amount must have at most two decimal places"));
    }
    if value > max {
        return Err(BankError::validation(format!("amount must not exceed {}", max)));
    }
    Ok(value)
}

/// Trimmed, lower-cased email address.
pub fn email(value: &str) -> Result<String, BankError> {
    let value = value.trim().to_lowercase();
    let valid = match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid || value.len() > MAX_TEXT_LEN || value.chars().any(char::is_whitespace) {
        return Err(BankError::validation("email address is invalid"));
    }
    Ok(value)
}

pub fn username(value: &str) -> Result<String, BankError> {
    let value = value.trim();
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-');
    if !(3..=32).contains(&value.len()) || !value.chars().all(allowed) {
        return Err(BankError::validation(
            "username must be 3 to 32 characters of letters, digits, '_', '.' or '-'",
        ));
    }
    Ok(value.to_string())
}

pub fn password(value: &str) -> Result<(), BankError> {
    if value.chars().count() < 8 {
        return Err(BankError::validation("password must be at least 8 characters"));
    }
    if value.len() > 1024 {
        return Err(BankError::validation("password is too long"));
    }
    Ok(())
}

/// Trimmed non-empty text of bounded length.
pub fn required(field: &str, value: &str) -> Result<String, BankError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BankError::validation(format!("{} is required", field)));
    }
    if value.chars().count() > MAX_TEXT_LEN {
        return Err(BankError::validation(format!("{} is too long", field)));
    }
    Ok(value.to_string())
}

pub fn optional_text(field: &str, value: Option<&str>) -> Result<String, BankError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => required(field, v),
        _ => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_rules() {
        let max = dec!(1000);
        assert_eq!(amount(dec!(10.50), max).unwrap(), dec!(10.5));
        assert!(amount(Decimal::ZERO, max).is_err());
        assert!(amount(dec!(-5), max).is_err());
        assert!(amount(dec!(1.005), max).is_err());
        assert!(amount(dec!(1000.01), max).is_err());
        assert_eq!(amount(dec!(2.500), max).unwrap(), dec!(2.5));
    }

    #[test]
    fn test_email_rules() {
        assert_eq!(email("  Alice@Example.COM ").unwrap(), "alice@example.com");
        assert!(email("alice").is_err());
        assert!(email("alice@localhost").is_err());
        assert!(email("@example.com").is_err());
        assert!(email("a b@example.com").is_err());
    }

    #[test]
    fn test_username_rules() {
        assert_eq!(username("john.doe-1").unwrap(), "john.doe-1");
        assert!(username("jo").is_err());
        assert!(username("john doe").is_err());
        assert!(username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_password_and_required_text() {
        assert!(password("short").is_err());
        assert!(password("long enough").is_ok());
        assert!(required("payee", "   ").is_err());
        assert_eq!(required("payee", " Acme ").unwrap(), "Acme");
        assert_eq!(optional_text("note", None).unwrap(), "");
    }
}
