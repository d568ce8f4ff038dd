use crate::model::Ms;

pub const MAX_SERVICES: usize = 10_000;
pub const MAX_WINDOWS_PER_SERVICE: usize = 100_000;
pub const MAX_BOOKINGS_PER_SERVICE: usize = 1_000_000;

/// Input bound on back-to-back sessions in a single commit: one per minute
/// of a day. The configured grid is tighter; a run that does not fit the
/// business day fails the hours check.
pub const MAX_SESSIONS_PER_BOOKING: u32 = 1_440;
pub const MAX_WINDOWS_PER_INSERT: usize = 500;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 500;
pub const MAX_USER_LEN: usize = 128;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single window may not stretch beyond one day.
pub const MAX_WINDOW_SPAN_MS: Ms = 86_400_000;
