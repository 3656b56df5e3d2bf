use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

/// Signed number of calendar-day boundaries crossed going from `a` to `b`.
///
/// Only the calendar date counts: two instants on the same day differ by 0 no
/// matter the time of day, and `day_difference(a, b) == -day_difference(b, a)`.
pub fn day_difference(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    if a > b {
        return -day_difference(b, a);
    }
    date_difference(a.date_naive(), b.date_naive())
}

/// Walks whole years by their day-of-year length, then settles the remainder
/// with the ordinals of the two dates. Requires `from <= to`.
fn date_difference(from: NaiveDate, to: NaiveDate) -> i64 {
    let mut days = 0i64;
    for year in from.year()..to.year() {
        days += days_in_year(year);
    }
    days + i64::from(to.ordinal()) - i64::from(from.ordinal())
}

fn days_in_year(year: i32) -> i64 {
    if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    }
}

/// True when the instant sits exactly on an hour boundary.
pub fn is_on_the_hour(t: DateTime<Utc>) -> bool {
    t.minute() == 0 && t.second() == 0 && t.nanosecond() == 0
}

/// True when `t` is strictly before the current hour of `now`: any earlier
/// day, or today with an hour that already started before `now`'s hour.
pub fn is_before_current_hour(t: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match day_difference(now, t) {
        d if d < 0 => true,
        0 => t.hour() < now.hour(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(s: &str) -> DateTime<Utc> {
        let d = NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap())
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn same_instant_is_zero() {
        let now = Utc::now();
        assert_eq!(day_difference(now, now), 0);
    }

    #[test]
    fn known_date_pairs() {
        let cases = [
            ("1999-12-31", "2000-01-01", 1),
            ("2000-01-01", "1999-12-31", -1),
            ("1999-12-31", "1999-12-25", -6),
            ("2000-12-31", "2003-10-25", 1028),
            ("2003-10-25", "2000-12-31", -1028),
            ("2000-12-30", "2020-12-31", 7306),
            ("2020-12-31", "2000-12-30", -7306),
        ];
        for (a, b, expected) in cases {
            assert_eq!(day_difference(date(a), date(b)), expected, "{a} -> {b}");
        }
    }

    #[test]
    fn time_of_day_is_ignored() {
        assert_eq!(day_difference(at(2006, 1, 2, 23, 54, 5), at(2006, 1, 2, 5, 4, 5)), 0);
        assert_eq!(day_difference(at(2006, 1, 2, 23, 59, 59), at(2006, 1, 3, 0, 0, 0)), 1);
        assert_eq!(day_difference(at(2006, 1, 3, 0, 0, 0), at(2006, 1, 2, 23, 59, 59)), -1);
    }

    #[test]
    fn antisymmetric_across_leap_years() {
        let anchors = [
            date("1996-02-28"),
            date("1999-12-31"),
            date("2000-02-29"),
            date("2004-03-01"),
            date("2024-12-31"),
        ];
        for &a in &anchors {
            for &b in &anchors {
                assert_eq!(day_difference(a, b), -day_difference(b, a));
            }
        }
    }

    #[test]
    fn matches_chrono_date_subtraction() {
        let a = date("1996-02-28");
        let b = date("2031-07-04");
        assert_eq!(
            day_difference(a, b),
            (b.date_naive() - a.date_naive()).num_days()
        );
    }

    #[test]
    fn on_the_hour() {
        assert!(is_on_the_hour(at(2030, 5, 6, 10, 0, 0)));
        assert!(!is_on_the_hour(at(2030, 5, 6, 10, 30, 0)));
        assert!(!is_on_the_hour(at(2030, 5, 6, 10, 0, 1)));
    }

    #[test]
    fn before_current_hour() {
        let now = at(2030, 5, 6, 10, 20, 0);
        assert!(is_before_current_hour(at(2030, 5, 5, 23, 0, 0), now));
        assert!(is_before_current_hour(at(2030, 5, 6, 9, 0, 0), now));
        assert!(!is_before_current_hour(at(2030, 5, 6, 10, 0, 0), now));
        assert!(!is_before_current_hour(at(2030, 5, 7, 0, 0, 0), now));
    }
}
