//! Time handling.
//!
//! All instants in the engine are UTC. Edition-hint dates are additionally
//! rounded to the nearest day before they enter the priority ordering:
//! millisecond precision would make date ties practically impossible, which
//! would both disable the capacity fallback key and let an attacker flood
//! the queue with hints that always win on recency.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};

/// The current UTC instant.
#[must_use]
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Round an instant to the nearest UTC day.
///
/// Times from 12:00:00 onwards round up to the following day.
#[must_use]
pub fn round_to_nearest_day(instant: DateTime<Utc>) -> NaiveDate {
    let date = instant.date_naive();
    if instant.hour() >= 12 {
        date.succ_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Format a date as the fixed-width `YYYYMMDD` used in priority strings.
#[must_use]
pub fn to_yyyymmdd(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Whether `date` lies in the future relative to `reference`, beyond a
/// small clock-skew allowance.
#[must_use]
pub fn is_future_date(date: DateTime<Utc>, reference: DateTime<Utc>) -> bool {
    date > reference + Duration::minutes(5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn morning_rounds_down() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 11, 59, 59).unwrap();
        assert_eq!(
            round_to_nearest_day(t),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
        );
    }

    #[test]
    fn afternoon_rounds_up() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
        assert_eq!(
            round_to_nearest_day(t),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()
        );
    }

    #[test]
    fn yyyymmdd_is_fixed_width() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(to_yyyymmdd(d), "20240102");
        assert_eq!(to_yyyymmdd(d).len(), 8);
    }

    #[test]
    fn future_date_allows_clock_skew() {
        let reference = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert!(!is_future_date(reference + Duration::minutes(4), reference));
        assert!(is_future_date(reference + Duration::minutes(6), reference));
        assert!(!is_future_date(reference - Duration::days(1), reference));
    }
}
