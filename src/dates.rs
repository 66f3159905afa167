use chrono::{Datelike, Days, Months, NaiveDate};

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("valid first of month")
}

/// Last day of the month containing `date`.
pub fn month_end(date: NaiveDate) -> NaiveDate {
    next_month_start(date) - Days::new(1)
}

/// First day of the month after the one containing `date`.
pub fn next_month_start(date: NaiveDate) -> NaiveDate {
    month_start(date) + Months::new(1)
}

/// Number of days in the month containing `date`.
pub fn days_in_month(date: NaiveDate) -> i64 {
    (next_month_start(date) - month_start(date)).num_days()
}

/// Inclusive day count of `[start, end]`.
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

/// `date` shifted forward by `months` calendar months, clamping the day to
/// the target month's length (chrono semantics: Jan 31 + 1 month = Feb 28/29).
pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date + Months::new(months)
}

/// Parse a `"YYYY-MM"` target month into its first day.
pub fn parse_year_month(raw: &str) -> Option<NaiveDate> {
    let (year, month) = raw.trim().split_once('-')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn month_boundaries() {
        assert_eq!(month_start(d(2024, 2, 17)), d(2024, 2, 1));
        assert_eq!(month_end(d(2024, 2, 17)), d(2024, 2, 29));
        assert_eq!(month_end(d(2023, 2, 3)), d(2023, 2, 28));
        assert_eq!(next_month_start(d(2024, 12, 31)), d(2025, 1, 1));
        assert_eq!(days_in_month(d(2024, 2, 1)), 29);
    }

    #[test]
    fn inclusive_day_count() {
        assert_eq!(days_inclusive(d(2024, 6, 1), d(2024, 6, 1)), 1);
        assert_eq!(days_inclusive(d(2024, 6, 1), d(2024, 6, 30)), 30);
    }

    #[test]
    fn month_addition_clamps() {
        assert_eq!(add_months(d(2024, 1, 31), 1), d(2024, 2, 29));
        assert_eq!(add_months(d(2024, 1, 15), 3), d(2024, 4, 15));
    }

    #[test]
    fn parses_year_month() {
        assert_eq!(parse_year_month("2024-03"), Some(d(2024, 3, 1)));
        assert_eq!(parse_year_month("2024-3"), Some(d(2024, 3, 1)));
        assert_eq!(parse_year_month("garbage"), None);
        assert_eq!(parse_year_month("2024-13"), None);
    }
}
