use crate::model::{HOUR_MS, MINUTE_MS, Ms};

pub const MIN_BOOKING_DURATION_MS: Ms = HOUR_MS;
pub const MAX_BOOKING_DURATION_MS: Ms = 6 * HOUR_MS;

/// Suggestion grid step.
pub const SLOT_GRID_MS: Ms = 30 * MINUTE_MS;
/// Suggested slots start at least this far after now, independent of the
/// configured minimum advance.
pub const SUGGESTION_LOOKAHEAD_MS: Ms = HOUR_MS;
pub const MAX_DAYS_TO_SEARCH: u32 = 30;

/// Upper bound on any hour-valued scheduling setting (one year).
pub const MAX_SETTING_HOURS: f64 = 8760.0;

/// Fixed buffer of the symmetric-universal policy.
pub const SYMMETRIC_BUFFER_MS: Ms = HOUR_MS;

pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_BOOKINGS: usize = 1_000_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * HOUR_MS;
pub const MAX_SQL_LEN: usize = 16 * 1024;

/// 1970-01-01 through 2200-01-01.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
