use std::{fmt, ops::RangeInclusive, str::FromStr};

use time::{macros::format_description, Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("invalid month '{0}', expected YYYY-MM")]
    InvalidMonth(String),
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

/// Years a parsed month may fall in. The upper bound leaves room for the
/// following month's start.
pub const SUPPORTED_YEARS: RangeInclusive<i32> = 1970..=9998;

/// A calendar month in the building's local offset; the billing interval is
/// `[start, end)` where `end` is the next month's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingMonth {
    year: i32,
    month: Month,
}

impl BillingMonth {
    pub const fn new(year: i32, month: Month) -> Self {
        Self { year, month }
    }

    /// Month that contains `at` when viewed at `offset`.
    pub fn containing(at: OffsetDateTime, offset: UtcOffset) -> Self {
        let local = at.to_offset(offset);
        Self::new(local.year(), local.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Month {
        self.month
    }

    pub fn next(&self) -> Self {
        match self.month {
            Month::December => Self::new(self.year + 1, Month::January),
            m => Self::new(self.year, m.next()),
        }
    }

    pub fn previous(&self) -> Self {
        match self.month {
            Month::January => Self::new(self.year - 1, Month::December),
            m => Self::new(self.year, m.previous()),
        }
    }

    /// `n` months before this one.
    pub fn back(&self, n: u32) -> Self {
        (0..n).fold(*self, |m, _| m.previous())
    }

    pub fn first_day(&self) -> Date {
        // Day 1 exists in every month of the supported year range.
        Date::from_calendar_date(self.year, self.month, 1).unwrap_or(Date::MIN)
    }

    pub fn last_day(&self) -> Date {
        let days = time::util::days_in_year_month(self.year, self.month);
        Date::from_calendar_date(self.year, self.month, days).unwrap_or(Date::MAX)
    }

    pub fn start(&self, offset: UtcOffset) -> OffsetDateTime {
        PrimitiveDateTime::new(self.first_day(), Time::MIDNIGHT).assume_offset(offset)
    }

    pub fn end(&self, offset: UtcOffset) -> OffsetDateTime {
        self.next().start(offset)
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month as u8)
    }
}

impl FromStr for BillingMonth {
    type Err = PeriodError;

    /// Strict `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PeriodError::InvalidMonth(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 7 || bytes[4] != b'-' {
            return Err(invalid());
        }
        let (year, month) = (&s[..4], &s[5..]);
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        if !SUPPORTED_YEARS.contains(&year) {
            return Err(invalid());
        }
        let month: u8 = month.parse().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Ok(Self::new(year, month))
    }
}

/// Strict `YYYY-MM-DD`.
pub fn parse_date(s: &str) -> Result<Date, PeriodError> {
    Date::parse(s.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|_| PeriodError::InvalidDate(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    #[test]
    fn parses_strict_year_month() {
        let m: BillingMonth = "2024-05".parse().unwrap();
        assert_eq!(m, BillingMonth::new(2024, Month::May));
        assert_eq!(m.to_string(), "2024-05");
    }

    #[test]
    fn rejects_malformed_months() {
        for bad in ["2024-13", "2024-1", "24-01", "abcd-ef", "2024-00", "2024/05", "", " 2024-05"] {
            assert!(bad.parse::<BillingMonth>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn rejects_years_without_a_following_month() {
        for bad in ["9999-12", "9999-01", "0000-01", "1969-12"] {
            assert!(bad.parse::<BillingMonth>().is_err(), "{bad} should be rejected");
        }
        let last: BillingMonth = "9998-12".parse().unwrap();
        assert_eq!(last.end(UtcOffset::UTC), datetime!(9999-01-01 00:00 UTC));
        assert_eq!(last.last_day(), date!(9998-12-31));
    }

    #[test]
    fn interval_is_half_open_in_local_offset() {
        let m = BillingMonth::new(2024, Month::December);
        let bkk = offset!(+7);
        assert_eq!(m.start(bkk), datetime!(2024-12-01 00:00 +7));
        assert_eq!(m.end(bkk), datetime!(2025-01-01 00:00 +7));
        assert_eq!(m.last_day(), date!(2024-12-31));
    }

    #[test]
    fn last_day_handles_leap_years() {
        assert_eq!(BillingMonth::new(2024, Month::February).last_day(), date!(2024-02-29));
        assert_eq!(BillingMonth::new(2023, Month::February).last_day(), date!(2023-02-28));
        assert_eq!(BillingMonth::new(2024, Month::April).last_day(), date!(2024-04-30));
    }

    #[test]
    fn containing_uses_local_calendar() {
        // 2024-05-31 20:00 UTC is already June in +07:00.
        let at = datetime!(2024-05-31 20:00 UTC);
        assert_eq!(BillingMonth::containing(at, offset!(+7)), BillingMonth::new(2024, Month::June));
        assert_eq!(BillingMonth::containing(at, UtcOffset::UTC), BillingMonth::new(2024, Month::May));
    }

    #[test]
    fn walks_back_across_years() {
        let m = BillingMonth::new(2024, Month::February);
        assert_eq!(m.back(3), BillingMonth::new(2023, Month::November));
        assert_eq!(m.back(0), m);
    }

    #[test]
    fn parses_dates() {
        assert_eq!(parse_date("2024-05-31").unwrap(), date!(2024-05-31));
        assert!(parse_date("2024-02-30").is_err());
        assert!(parse_date("31/05/2024").is_err());
    }
}
