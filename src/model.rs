use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Ids owned by the account / organizer / participant services.
pub type ActorId = i64;
pub type OrganizationId = i64;
pub type EventId = i64;

pub type Instant = DateTime<Utc>;

/// A booking window `[start, finish)`. Nothing here enforces ordering; the
/// conflict detector decides what a valid window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Instant,
    pub finish: Instant,
}

impl Window {
    pub fn new(start: Instant, finish: Instant) -> Self {
        Self { start, finish }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl DayOfWeek {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Sun => "SUN",
            DayOfWeek::Mon => "MON",
            DayOfWeek::Tue => "TUE",
            DayOfWeek::Wed => "WED",
            DayOfWeek::Thu => "THU",
            DayOfWeek::Fri => "FRI",
            DayOfWeek::Sat => "SAT",
        }
    }

    /// Accepts `MON`, `Monday`, `monday`, ...
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        let day = match lower.get(..3)? {
            "sun" => DayOfWeek::Sun,
            "mon" => DayOfWeek::Mon,
            "tue" => DayOfWeek::Tue,
            "wed" => DayOfWeek::Wed,
            "thu" => DayOfWeek::Thu,
            "fri" => DayOfWeek::Fri,
            "sat" => DayOfWeek::Sat,
            _ => return None,
        };
        let full = format!("{}day", day.full_prefix());
        if lower.len() == 3 || lower == full {
            Some(day)
        } else {
            None
        }
    }

    fn full_prefix(&self) -> &'static str {
        match self {
            DayOfWeek::Sun => "sun",
            DayOfWeek::Mon => "mon",
            DayOfWeek::Tue => "tues",
            DayOfWeek::Wed => "wednes",
            DayOfWeek::Thu => "thurs",
            DayOfWeek::Fri => "fri",
            DayOfWeek::Sat => "satur",
        }
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(w: Weekday) -> Self {
        match w {
            Weekday::Sun => DayOfWeek::Sun,
            Weekday::Mon => DayOfWeek::Mon,
            Weekday::Tue => DayOfWeek::Tue,
            Weekday::Wed => DayOfWeek::Wed,
            Weekday::Thu => DayOfWeek::Thu,
            Weekday::Fri => DayOfWeek::Fri,
            Weekday::Sat => DayOfWeek::Sat,
        }
    }
}

/// Open hours for one weekday, half-open `[start_hour, finish_hour)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHour {
    pub day: DayOfWeek,
    pub start_hour: u32,
    pub finish_hour: u32,
}

impl OperatingHour {
    pub fn new(day: DayOfWeek, start_hour: u32, finish_hour: u32) -> Self {
        Self { day, start_hour, finish_hour }
    }

    pub fn hour_count(&self) -> usize {
        self.finish_hour.saturating_sub(self.start_hour) as usize
    }
}

/// At most one entry per weekday; insertion order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours(Vec<OperatingHour>);

impl OperatingHours {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert or replace the entry for `hour.day`.
    pub fn set(&mut self, hour: OperatingHour) {
        match self.0.iter_mut().find(|h| h.day == hour.day) {
            Some(existing) => *existing = hour,
            None => self.0.push(hour),
        }
    }

    pub fn get(&self, day: DayOfWeek) -> Option<&OperatingHour> {
        self.0.iter().find(|h| h.day == day)
    }

    /// Entry for the weekday `t` falls on.
    pub fn on(&self, t: Instant) -> Option<&OperatingHour> {
        self.get(chrono::Datelike::weekday(&t).into())
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperatingHour> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<OperatingHour> for OperatingHours {
    fn from_iter<I: IntoIterator<Item = OperatingHour>>(iter: I) -> Self {
        let mut hours = OperatingHours::new();
        for h in iter {
            hours.set(h);
        }
        hours
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Facility {
    pub id: Ulid,
    pub organization_id: OrganizationId,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    pub operating_hours: OperatingHours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Approved,
    Rejected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Status::Pending),
            "APPROVED" => Some(Status::Approved),
            "REJECTED" => Some(Status::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityRequest {
    pub id: Ulid,
    pub event_id: EventId,
    pub facility_id: Ulid,
    pub status: Status,
    /// Only ever set on REJECTED.
    pub reject_reason: Option<String>,
    pub start: Instant,
    pub finish: Instant,
}

impl FacilityRequest {
    pub fn window(&self) -> Window {
        Window::new(self.start, self.finish)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacilityRequestWithFacility {
    pub request: FacilityRequest,
    pub facility: Facility,
}

/// Capabilities checked by the permission service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    UpdateEvent,
    UpdateFacility,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::UpdateEvent => "UPDATE_EVENT",
            Permission::UpdateFacility => "UPDATE_FACILITY",
        }
    }
}

/// Read-only view of an event from the participant service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: EventId,
    pub organization_id: OrganizationId,
}

// ── Availability ─────────────────────────────────────────────────

/// Free/busy flags for an open day, index 0 is `first_hour`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HourSlots {
    pub first_hour: u32,
    pub free: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Day {
    pub date: NaiveDate,
    /// `None` when the facility is closed that weekday.
    pub slots: Option<HourSlots>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityGrid {
    pub days: Vec<Day>,
}

impl AvailabilityGrid {
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types, flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    FacilityRegistered {
        id: Ulid,
        organization_id: OrganizationId,
        name: String,
        latitude: f64,
        longitude: f64,
        description: String,
    },
    OperatingHoursSet {
        facility_id: Ulid,
        hours: Vec<OperatingHour>,
    },
    RequestCreated {
        id: Ulid,
        event_id: EventId,
        facility_id: Ulid,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        start: Instant,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        finish: Instant,
    },
    RequestStatusChanged {
        id: Ulid,
        status: Status,
        reject_reason: Option<String>,
    },
}
