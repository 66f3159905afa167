use chrono::NaiveDate;
use serde_json::json;

use crate::dates::{days_in_month, days_inclusive, month_end, month_start};
use crate::models::LineItem;

/// How a partial billing month (one that does not span its full calendar
/// month) is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrataPolicy {
    /// Charge the full monthly rent regardless of occupied days.
    FullCharge,
    /// Waive the partial month entirely.
    Free,
    /// Charge full rent when at least `min_days` are occupied, otherwise
    /// prorate daily.
    Threshold { min_days: u32 },
}

impl ProrataPolicy {
    pub fn parse(raw: &str, threshold_days: u32) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" | "full_charge" => Self::FullCharge,
            "free" => Self::Free,
            _ => Self::Threshold {
                min_days: threshold_days,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullCharge => "full_charge",
            Self::Free => "free",
            Self::Threshold { .. } => "threshold",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PricedPeriod {
    pub amount: i64,
    pub line_items: Vec<LineItem>,
}

/// Price one billing period of a monthly contract. A period spanning its
/// whole calendar month is one plain rent line; a partial first/last month
/// goes through the prorata policy.
pub fn price_period(
    rent_amount: i64,
    period_start: NaiveDate,
    period_end: NaiveDate,
    policy: ProrataPolicy,
) -> PricedPeriod {
    let full_month = period_start == month_start(period_start)
        && period_end == month_end(period_start);

    if full_month {
        let label = format!("Rent {}", period_start.format("%Y-%m"));
        return PricedPeriod {
            amount: rent_amount,
            line_items: vec![LineItem::new("rent", &label, rent_amount)],
        };
    }

    let occupied = days_inclusive(period_start, period_end);
    let month_days = days_in_month(period_start);
    let meta = json!({
        "policy": policy.as_str(),
        "occupied_days": occupied,
        "days_in_month": month_days,
    });
    let label = format!(
        "Rent {} ({} of {} days)",
        period_start.format("%Y-%m"),
        occupied,
        month_days
    );

    let amount = match policy {
        ProrataPolicy::FullCharge => rent_amount,
        ProrataPolicy::Free => 0,
        ProrataPolicy::Threshold { min_days } => {
            if occupied >= i64::from(min_days) {
                rent_amount
            } else {
                // Daily proration, rounded to the nearest unit.
                (rent_amount * occupied + month_days / 2) / month_days
            }
        }
    };

    PricedPeriod {
        amount,
        line_items: vec![LineItem::new("rent_prorated", &label, amount).with_meta(meta)],
    }
}

/// Deposit line for a contract's initial invoice.
pub fn deposit_line(deposit_amount: i64) -> Option<LineItem> {
    if deposit_amount <= 0 {
        return None;
    }
    Some(LineItem::new("deposit", "Security deposit", deposit_amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn full_month_is_plain_rent() {
        let priced = price_period(1_500_000, d(2024, 2, 1), d(2024, 2, 29), ProrataPolicy::Free);
        assert_eq!(priced.amount, 1_500_000);
        assert_eq!(priced.line_items.len(), 1);
        assert_eq!(priced.line_items[0].code, "rent");
    }

    #[test]
    fn partial_month_full_charge_policy() {
        let priced = price_period(
            1_500_000,
            d(2024, 1, 20),
            d(2024, 1, 31),
            ProrataPolicy::FullCharge,
        );
        assert_eq!(priced.amount, 1_500_000);
    }

    #[test]
    fn partial_month_free_policy() {
        let priced = price_period(1_500_000, d(2024, 1, 20), d(2024, 1, 31), ProrataPolicy::Free);
        assert_eq!(priced.amount, 0);
    }

    #[test]
    fn threshold_charges_full_at_or_above_min_days() {
        // 17 occupied days out of 31, threshold 15 -> full rent.
        let priced = price_period(
            1_500_000,
            d(2024, 1, 15),
            d(2024, 1, 31),
            ProrataPolicy::Threshold { min_days: 15 },
        );
        assert_eq!(priced.amount, 1_500_000);
    }

    #[test]
    fn threshold_prorates_below_min_days() {
        // 10 occupied days out of 30, threshold 15 -> 10/30 of rent.
        let priced = price_period(
            900_000,
            d(2024, 6, 21),
            d(2024, 6, 30),
            ProrataPolicy::Threshold { min_days: 15 },
        );
        assert_eq!(priced.amount, 300_000);
        assert_eq!(priced.line_items[0].code, "rent_prorated");
    }

    #[test]
    fn policy_parsing() {
        assert_eq!(ProrataPolicy::parse("full", 15), ProrataPolicy::FullCharge);
        assert_eq!(ProrataPolicy::parse("FREE", 15), ProrataPolicy::Free);
        assert_eq!(
            ProrataPolicy::parse("threshold", 10),
            ProrataPolicy::Threshold { min_days: 10 }
        );
        assert_eq!(
            ProrataPolicy::parse("unknown", 12),
            ProrataPolicy::Threshold { min_days: 12 }
        );
    }

    #[test]
    fn deposit_line_only_when_positive() {
        assert!(deposit_line(0).is_none());
        let line = deposit_line(500_000).unwrap();
        assert_eq!(line.code, "deposit");
        assert_eq!(line.amount, 500_000);
    }
}
