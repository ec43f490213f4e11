use std::collections::BTreeMap;

use bankd_core::{Expenditure, Page};
use rust_decimal::Decimal;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::Bank;
use crate::{auth::CallerIdentity, error::BankError, validation};

pub const DEFAULT_ANALYTICS_MONTHS: u32 = 6;
pub const MAX_ANALYTICS_MONTHS: u32 = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyFlow {
    /// `YYYY-MM`
    pub month: String,
    pub inflow: Decimal,
    pub outflow: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analytics {
    pub months: Vec<MonthlyFlow>,
    pub by_kind: BTreeMap<String, Decimal>,
    pub by_category: BTreeMap<String, Decimal>,
}

/// Months since year zero, for window arithmetic.
fn month_index(date: Date) -> i32 {
    date.year() * 12 + (date.month() as i32 - 1)
}

fn month_label(index: i32) -> String {
    format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
}

impl Bank {
    pub fn record_expenditure(
        &self,
        caller: &CallerIdentity,
        category: &str,
        amount: Decimal,
        note: Option<&str>,
        spent_on: Option<Date>,
    ) -> Result<Expenditure, BankError> {
        let user_id = caller.require_user()?;
        let now = OffsetDateTime::now_utc();
        let expenditure = Expenditure {
            id: Uuid::new_v4(),
            user_id,
            category: validation::required("category", category)?.to_lowercase(),
            amount: validation::amount(amount, self.settings.max_transaction_amount)?,
            note: validation::optional_text("note", note)?,
            spent_on: spent_on.unwrap_or_else(|| now.date()),
            created_at: now,
        };
        self.storage.create_expenditure(&expenditure)?;
        Ok(expenditure)
    }

    pub fn list_expenditures(&self, caller: &CallerIdentity) -> Result<Vec<Expenditure>, BankError> {
        let user_id = caller.require_user()?;
        Ok(self.storage.list_expenditures(user_id)?)
    }

    /// Cash flow over the last `months` calendar months, including the current one.
    pub fn analytics(&self, caller: &CallerIdentity, months: Option<u32>) -> Result<Analytics, BankError> {
        let user_id = caller.require_user()?;
        let months = months.unwrap_or(DEFAULT_ANALYTICS_MONTHS);
        if !(1..=MAX_ANALYTICS_MONTHS).contains(&months) {
            return Err(BankError::validation(format!(
                "months must be between 1 and {}",
                MAX_ANALYTICS_MONTHS
            )));
        }

        let current = month_index(OffsetDateTime::now_utc().date());
        let first = current - (months as i32 - 1);
        let mut flows: BTreeMap<i32, (Decimal, Decimal)> =
            (first..=current).map(|m| (m, (Decimal::ZERO, Decimal::ZERO))).collect();
        let mut by_kind: BTreeMap<String, Decimal> = BTreeMap::new();

        for account in self.storage.list_accounts(Some(user_id))? {
            for entry in self.storage.list_entries(account.id, Page::all())? {
                let Some(flow) = flows.get_mut(&month_index(entry.created_at.date())) else {
                    continue;
                };
                if entry.amount.is_sign_positive() {
                    flow.0 += entry.amount;
                } else {
                    flow.1 += -entry.amount;
                }
                *by_kind.entry(entry.kind.to_string()).or_default() += entry.amount.abs();
            }
        }

        let mut by_category: BTreeMap<String, Decimal> = BTreeMap::new();
        for expenditure in self.storage.list_expenditures(user_id)? {
            let index = month_index(expenditure.spent_on);
            if (first..=current).contains(&index) {
                *by_category.entry(expenditure.category).or_default() += expenditure.amount;
            }
        }

        Ok(Analytics {
            months: flows
                .into_iter()
                .map(|(index, (inflow, outflow))| MonthlyFlow {
                    month: month_label(index),
                    inflow,
                    outflow,
                    net: inflow - outflow,
                })
                .collect(),
            by_kind,
            by_category,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::testing::{bank, customer};
    use rust_decimal_macros::dec;
    use time::Month;

    #[test]
    fn test_month_labels() {
        let date = Date::from_calendar_date(2024, Month::January, 15).unwrap();
        assert_eq!(month_label(month_index(date)), "2024-01");
        assert_eq!(month_label(month_index(date) - 1), "2023-12");
    }

    #[test]
    fn test_expenditures_are_recorded_and_listed() {
        let bank = bank();
        let (alice, _) = customer(&bank, "alice", 0);
        let spent_on = Date::from_calendar_date(2024, Month::March, 2).unwrap();
        let recorded = bank
            .record_expenditure(&alice, "Groceries", dec!(42.10), Some("weekly shop"), Some(spent_on))
            .unwrap();
        assert_eq!(recorded.category, "groceries");
        assert_eq!(bank.list_expenditures(&alice).unwrap(), vec![recorded]);
        assert!(bank.record_expenditure(&alice, "", dec!(1), None, None).is_err());
    }

    #[test]
    fn test_analytics_sums_current_month() {
        let bank = bank();
        let (alice, account) = customer(&bank, "alice", 200);
        bank.withdraw(&alice, account.id, dec!(50), None, None).unwrap();
        bank.record_expenditure(&alice, "fuel", dec!(30), None, None).unwrap();

        let analytics = bank.analytics(&alice, Some(3)).unwrap();
        assert_eq!(analytics.months.len(), 3);
        let this_month = analytics.months.last().unwrap();
        assert_eq!(this_month.inflow, dec!(200));
        assert_eq!(this_month.outflow, dec!(50));
        assert_eq!(this_month.net, dec!(150));
        assert_eq!(analytics.by_kind["withdrawal"], dec!(50));
        assert_eq!(analytics.by_category["fuel"], dec!(30));
    }

    #[test]
    fn test_analytics_window_is_bounded() {
        let bank = bank();
        let (alice, _) = customer(&bank, "alice", 0);
        assert!(bank.analytics(&alice, Some(0)).is_err());
        assert!(bank.analytics(&alice, Some(25)).is_err());
        assert_eq!(bank.analytics(&alice, None).unwrap().months.len(), 6);
    }
}
