use chrono::{Datelike, Days, NaiveDate, Timelike};

use crate::calendar::{day_difference, is_before_current_hour};
use crate::limits::BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::EngineError;

// ── Availability Grid ─────────────────────────────────────────────

/// Sanity check for an availability query: a non-empty day range, ending
/// inside the booking horizon, not starting in the past.
pub(crate) fn check_query_horizon(range: &Window, now: Instant) -> Result<(), EngineError> {
    if day_difference(range.start, range.finish) + 1 <= 0 {
        return Err(EngineError::invalid("finish must not be before start"));
    }
    if day_difference(now, range.finish) >= BOOKING_HORIZON_DAYS {
        return Err(EngineError::invalid(format!(
            "availability is known at most {BOOKING_HORIZON_DAYS} days ahead"
        )));
    }
    if is_before_current_hour(range.start, now) {
        return Err(EngineError::invalid("start is in the past"));
    }
    Ok(())
}

/// One day per calendar day of `range`, all open hours free. Closed weekdays
/// carry no slots at all.
pub fn build_empty_grid(range: &Window, hours: &OperatingHours) -> AvailabilityGrid {
    let len = (day_difference(range.start, range.finish) + 1).max(0) as u64;
    let first = range.start.date_naive();
    let days = (0..len)
        .map_while(|i| first.checked_add_days(Days::new(i)))
        .map(|date| empty_day(date, hours))
        .collect();
    AvailabilityGrid { days }
}

fn empty_day(date: NaiveDate, hours: &OperatingHours) -> Day {
    let slots = hours.get(date.weekday().into()).map(|open| HourSlots {
        first_hour: open.start_hour,
        free: vec![true; open.hour_count()],
    });
    Day { date, slots }
}

/// Mark hours taken by `requests`.
///
/// The row is the day-of-month difference to `range_start`, so placement is
/// only right while the range stays inside one month; requests landing outside
/// the grid are skipped. A slot is cleared when it is still free and its hour
/// is at or before the request's start hour, or when its hour is at or after
/// the request's finish hour.
pub fn apply_requests(
    grid: &mut AvailabilityGrid,
    range_start: Instant,
    hours: &OperatingHours,
    requests: &[FacilityRequest],
) {
    for request in requests {
        let Some(open) = hours.on(request.start) else { continue };
        let index = i64::from(request.start.day()) - i64::from(range_start.day());
        let Ok(index) = usize::try_from(index) else { continue };
        let Some(slots) = grid.days.get_mut(index).and_then(|d| d.slots.as_mut()) else {
            continue;
        };

        let (start_hour, finish_hour) = (request.start.hour(), request.finish.hour());
        for (offset, free) in slots.free.iter_mut().enumerate() {
            let current = open.start_hour + offset as u32;
            if (*free && current <= start_hour) || current >= finish_hour {
                *free = false;
            }
        }
    }
}

/// First instant of `range.start`'s day up to the first instant after
/// `range.finish`'s day.
pub(crate) fn day_bounds(range: &Window) -> Window {
    let start = range.start.date_naive();
    let finish = range.finish.date_naive();
    let next = finish.succ_opt().unwrap_or(finish);
    Window::new(midnight(start, range.start), midnight(next, range.finish))
}

fn midnight(date: NaiveDate, fallback: Instant) -> Instant {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ulid::Ulid;

    fn at(month: u32, day: u32, hour: u32) -> Instant {
        Utc.with_ymd_and_hms(2030, month, day, hour, 0, 0).unwrap()
    }

    fn range(from: Instant, to: Instant) -> Window {
        Window::new(from, to)
    }

    fn approved(start: Instant, finish: Instant) -> FacilityRequest {
        FacilityRequest {
            id: Ulid::new(),
            event_id: 1,
            facility_id: Ulid::new(),
            status: Status::Approved,
            reject_reason: None,
            start,
            finish,
        }
    }

    fn mon_wed_hours() -> OperatingHours {
        [
            OperatingHour::new(DayOfWeek::Mon, 9, 17),
            OperatingHour::new(DayOfWeek::Wed, 10, 14),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn empty_grid_marks_closed_days() {
        // Mon 2030-05-06 .. Wed 2030-05-08, Tuesday closed
        let grid = build_empty_grid(&range(at(5, 6, 0), at(5, 8, 0)), &mon_wed_hours());
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.days[0].slots.as_ref().unwrap().free, vec![true; 8]);
        assert!(grid.days[1].slots.is_none());
        let wed = grid.days[2].slots.as_ref().unwrap();
        assert_eq!(wed.first_hour, 10);
        assert_eq!(wed.free, vec![true; 4]);
        assert_eq!(grid.days[2].date, NaiveDate::from_ymd_opt(2030, 5, 8).unwrap());
    }

    #[test]
    fn grid_length_follows_day_difference() {
        let hours = mon_wed_hours();
        assert_eq!(build_empty_grid(&range(at(5, 6, 23), at(5, 6, 1)), &hours).len(), 1);
        assert_eq!(build_empty_grid(&range(at(5, 28, 0), at(6, 3, 0)), &hours).len(), 7);
        assert!(build_empty_grid(&range(at(5, 8, 0), at(5, 6, 0)), &hours).is_empty());
    }

    #[test]
    fn masking_rule_is_literal() {
        let hours = mon_wed_hours();
        let r = range(at(5, 6, 0), at(5, 6, 0));
        let mut grid = build_empty_grid(&r, &hours);
        apply_requests(&mut grid, r.start, &hours, &[approved(at(5, 6, 12), at(5, 6, 14))]);
        // hours 9..=12 cleared by `current <= start`, 14.. by `current >= finish`
        let free = &grid.days[0].slots.as_ref().unwrap().free;
        assert_eq!(free, &vec![false, false, false, false, true, false, false, false]);
    }

    #[test]
    fn requests_on_closed_weekdays_are_skipped() {
        let hours = mon_wed_hours();
        let r = range(at(5, 6, 0), at(5, 8, 0));
        let mut grid = build_empty_grid(&r, &hours);
        let before = grid.clone();
        apply_requests(&mut grid, r.start, &hours, &[approved(at(5, 7, 10), at(5, 7, 11))]);
        assert_eq!(grid, before);
    }

    #[test]
    fn row_is_day_of_month_difference() {
        let hours = mon_wed_hours();
        // Wed 2030-05-29 .. Mon 2030-06-03 crosses a month boundary
        let r = range(at(5, 29, 0), at(6, 3, 0));
        let mut grid = build_empty_grid(&r, &hours);
        let before = grid.clone();
        // 3 - 29 is negative: the request is not placed anywhere
        apply_requests(&mut grid, r.start, &hours, &[approved(at(6, 3, 10), at(6, 3, 11))]);
        assert_eq!(grid, before);
    }

    #[test]
    fn query_horizon() {
        let now = at(5, 6, 8);
        assert!(check_query_horizon(&range(at(5, 6, 9), at(5, 8, 0)), now).is_ok());
        assert!(check_query_horizon(&range(at(5, 8, 0), at(5, 6, 0)), now).is_err());
        assert!(check_query_horizon(&range(at(5, 6, 9), at(6, 5, 0)), now).is_err());
        assert!(check_query_horizon(&range(at(5, 5, 9), at(5, 6, 0)), now).is_err());
        assert!(check_query_horizon(&range(at(5, 6, 7), at(5, 6, 9)), now).is_err());
    }

    #[test]
    fn day_bounds_cover_whole_days() {
        let b = day_bounds(&range(at(5, 6, 9), at(5, 8, 13)));
        assert_eq!(b.start, at(5, 6, 0));
        assert_eq!(b.finish, at(5, 9, 0));
    }
}
