//! Budget period windows.
//!
//! Windows are computed by truncating the current instant to the granularity
//! in UTC; weekly windows start on ISO Monday. A window is the half-open
//! interval [start, end).

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc};

use crate::model::Granularity;

/// The window containing `now`.
pub fn window(granularity: Granularity, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = now.date_naive();
    let start_naive = match granularity {
        Granularity::Hourly => date
            .and_hms_opt(now.hour(), 0, 0)
            .expect("hour truncation is always valid"),
        Granularity::Daily => date.and_hms_opt(0, 0, 0).expect("midnight is always valid"),
        Granularity::Weekly => {
            let monday = date - Duration::days(date.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0).expect("midnight is always valid")
        }
        Granularity::Monthly => date
            .with_day(1)
            .expect("day 1 exists in every month")
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid"),
    };
    let start = Utc.from_utc_datetime(&start_naive);
    (start, end_of(granularity, start))
}

/// The exclusive end of a window beginning at `start`.
pub fn end_of(granularity: Granularity, start: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        Granularity::Hourly => start + Duration::hours(1),
        Granularity::Daily => start + Duration::days(1),
        Granularity::Weekly => start + Duration::days(7),
        Granularity::Monthly => start
            .checked_add_months(Months::new(1))
            .expect("month addition within supported range"),
    }
}

/// True when `used` crossed the `percent` threshold of `limit` in the step
/// from `before` to `after` (upward crossings only, so steady consumption
/// past a threshold warns exactly once).
pub fn crossed_threshold(before: i64, after: i64, limit: i64, percent: i64) -> bool {
    if limit <= 0 {
        return false;
    }
    before * 100 < limit * percent && after * 100 >= limit * percent
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, s)
                .unwrap(),
        )
    }

    #[test]
    fn hourly_window_truncates_to_hour() {
        let (start, end) = window(Granularity::Hourly, at(2026, 8, 1, 14, 37, 12));
        assert_eq!(start, at(2026, 8, 1, 14, 0, 0));
        assert_eq!(end, at(2026, 8, 1, 15, 0, 0));
    }

    #[test]
    fn daily_window_starts_at_midnight_utc() {
        let (start, end) = window(Granularity::Daily, at(2026, 8, 1, 23, 59, 59));
        assert_eq!(start, at(2026, 8, 1, 0, 0, 0));
        assert_eq!(end, at(2026, 8, 2, 0, 0, 0));
    }

    #[test]
    fn weekly_window_starts_on_monday() {
        // 2026-08-01 is a Saturday; the ISO week began Monday 2026-07-27.
        let (start, end) = window(Granularity::Weekly, at(2026, 8, 1, 10, 0, 0));
        assert_eq!(start, at(2026, 7, 27, 0, 0, 0));
        assert_eq!(end, at(2026, 8, 3, 0, 0, 0));
    }

    #[test]
    fn monthly_window_spans_calendar_month() {
        let (start, end) = window(Granularity::Monthly, at(2026, 2, 15, 8, 0, 0));
        assert_eq!(start, at(2026, 2, 1, 0, 0, 0));
        assert_eq!(end, at(2026, 3, 1, 0, 0, 0));

        // January rolls into the next year.
        let (start, end) = window(Granularity::Monthly, at(2026, 12, 31, 23, 0, 0));
        assert_eq!(start, at(2026, 12, 1, 0, 0, 0));
        assert_eq!(end, at(2027, 1, 1, 0, 0, 0));
    }

    #[test]
    fn windows_are_half_open_and_contiguous() {
        for granularity in [
            Granularity::Hourly,
            Granularity::Daily,
            Granularity::Weekly,
            Granularity::Monthly,
        ] {
            let now = at(2026, 8, 1, 14, 37, 12);
            let (start, end) = window(granularity, now);
            assert!(start <= now && now < end);

            let (next_start, _) = window(granularity, end);
            assert_eq!(next_start, end, "{granularity:?} windows must tile");
        }
    }

    #[test]
    fn threshold_fires_only_on_upward_crossing() {
        // limit 1000, 75% threshold at 750
        assert!(crossed_threshold(700, 760, 1000, 75));
        assert!(crossed_threshold(749, 750, 1000, 75));
        assert!(!crossed_threshold(750, 800, 1000, 75)); // already past
        assert!(!crossed_threshold(700, 749, 1000, 75)); // not reached
        assert!(!crossed_threshold(700, 760, 0, 75)); // no limit
    }

    #[test]
    fn threshold_can_cross_both_marks_in_one_step() {
        assert!(crossed_threshold(700, 950, 1000, 75));
        assert!(crossed_threshold(700, 950, 1000, 90));
    }
}
