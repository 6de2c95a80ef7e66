//! Calendar arithmetic in Asia/Shanghai.
//!
//! Daily caps, package date ranges and daily-usage rows are all keyed on the
//! Shanghai calendar day. Shanghai has been fixed at UTC+8 with no DST since
//! 1991, so a `FixedOffset` is sufficient.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};

const SHANGHAI_UTC_OFFSET_SECS: i32 = 8 * 3600;

pub fn shanghai_offset() -> FixedOffset {
    FixedOffset::east_opt(SHANGHAI_UTC_OFFSET_SECS).expect("fixed offset in range")
}

/// Today's calendar date in Asia/Shanghai.
pub fn today() -> NaiveDate {
    shanghai_date(Utc::now())
}

/// The Shanghai calendar date of a UTC instant.
pub fn shanghai_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&shanghai_offset()).date_naive()
}

/// UTC bounds `[start, end)` of a Shanghai calendar day, for range scans
/// against `created_at` timestamps.
pub fn day_bounds_utc(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start_local = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_local_timezone(shanghai_offset())
        .single()
        .expect("fixed offset is unambiguous");
    let start = start_local.with_timezone(&Utc);
    (start, start + Duration::days(1))
}

/// UTC bound of the first instant of the month containing `date`.
pub fn month_start_utc(date: NaiveDate) -> DateTime<Utc> {
    let first =
        NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month exists");
    day_bounds_utc(first).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone};

    #[test]
    fn utc_evening_is_next_shanghai_day() {
        // 2026-03-01 17:00 UTC is 2026-03-02 01:00 in Shanghai.
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 17, 0, 0).unwrap();
        assert_eq!(shanghai_date(at), NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    }

    #[test]
    fn day_bounds_cover_exactly_one_day() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let (start, end) = day_bounds_utc(date);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 1, 16, 0, 0).unwrap());
        assert_eq!(end - start, Duration::days(1));
    }

    #[test]
    fn month_start_is_shanghai_midnight() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        let start = month_start_utc(date);
        assert_eq!(start.day(), 28);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 28, 16, 0, 0).unwrap());
    }
}
