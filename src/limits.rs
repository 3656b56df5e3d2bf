/// Bookings and availability queries must land within this many calendar days of today.
pub const BOOKING_HORIZON_DAYS: i64 = 30;

pub const HOURS_PER_DAY: u32 = 24;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_REJECT_REASON_LEN: usize = 1024;

/// Upper bound on a single collaborator response frame.
pub const MAX_DIRECTORY_FRAME_LEN: usize = 64 * 1024;
