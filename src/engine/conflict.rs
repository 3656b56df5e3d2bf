use chrono::{Datelike, Timelike};
use ulid::Ulid;

use crate::calendar::{day_difference, is_before_current_hour, is_on_the_hour};
use crate::limits::BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::store::Store;
use super::EngineError;

/// Collision between a candidate and a stored window. Not the symmetric
/// interval test: a candidate that strictly contains a stored window does
/// not collide.
pub(crate) fn collides(candidate: &Window, stored: &Window) -> bool {
    (candidate.start >= stored.start && candidate.start < stored.finish)
        || (candidate.finish > stored.start && candidate.finish <= stored.finish)
}

/// Calendar and operating-hour rules for a new booking window.
pub(crate) fn validate_window(
    window: &Window,
    hours: &OperatingHours,
    now: Instant,
) -> Result<(), EngineError> {
    let Window { start, finish } = *window;

    if start.date_naive() != finish.date_naive() {
        return Err(EngineError::invalid("start and finish must be on the same day"));
    }
    if day_difference(now, start) >= BOOKING_HORIZON_DAYS {
        return Err(EngineError::invalid(format!(
            "bookings open at most {BOOKING_HORIZON_DAYS} days ahead"
        )));
    }
    if is_before_current_hour(start, now) {
        return Err(EngineError::invalid("window is in the past"));
    }
    if !is_on_the_hour(start) || !is_on_the_hour(finish) {
        return Err(EngineError::invalid("start and finish must be on the hour"));
    }
    if start.hour() >= finish.hour() {
        return Err(EngineError::invalid("start must be before finish"));
    }
    let Some(open) = hours.on(start) else {
        return Err(EngineError::invalid(format!(
            "facility is closed on {}",
            DayOfWeek::from(start.weekday()).as_str()
        )));
    };
    if start.hour() < open.start_hour || finish.hour() > open.finish_hour {
        return Err(EngineError::invalid(format!(
            "facility opens {}:00-{}:00 on {}",
            open.start_hour,
            open.finish_hour,
            open.day.as_str()
        )));
    }
    Ok(())
}

/// True when an APPROVED request on the facility collides with `window`.
pub(crate) async fn has_overlap(
    store: &dyn Store,
    facility_id: Ulid,
    window: Window,
) -> Result<bool, EngineError> {
    store.get_facility(facility_id).await?;
    let count = store.count_approved_overlap(facility_id, window).await?;
    Ok(count != 0)
}
