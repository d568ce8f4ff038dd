//! Business-timezone conversions.
//!
//! Everything stored is an instant (`Ms`). Every business rule is evaluated
//! on local civil time in one fixed IANA zone.

use chrono::offset::LocalResult;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::Ms;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// Fields do not form a real local date-time (malformed, nonexistent or ambiguous).
    InvalidDateTime(String),
    /// Instant outside the representable range.
    OutOfRange(Ms),
}

impl std::fmt::Display for ClockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockError::InvalidDateTime(s) => write!(f, "invalid date-time: {s}"),
            ClockError::OutOfRange(ms) => write!(f, "instant out of range: {ms}"),
        }
    }
}

impl std::error::Error for ClockError {}

#[derive(Debug, Clone, Copy)]
pub struct BusinessClock {
    tz: Tz,
}

impl BusinessClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn to_local(&self, instant: Ms) -> Result<NaiveDateTime, ClockError> {
        let utc = DateTime::<Utc>::from_timestamp_millis(instant)
            .ok_or(ClockError::OutOfRange(instant))?;
        Ok(utc.with_timezone(&self.tz).naive_local())
    }

    /// Local civil time → instant. Gaps and folds (DST) are rejected rather
    /// than guessed.
    pub fn to_instant(&self, date: NaiveDate, time: NaiveTime) -> Result<Ms, ClockError> {
        self.local_to_instant(&date.and_time(time))
    }

    pub fn local_to_instant(&self, local: &NaiveDateTime) -> Result<Ms, ClockError> {
        match self.tz.from_local_datetime(local) {
            LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
            LocalResult::Ambiguous(..) => Err(ClockError::InvalidDateTime(format!(
                "{local} is ambiguous in {}",
                self.tz
            ))),
            LocalResult::None => Err(ClockError::InvalidDateTime(format!(
                "{local} does not exist in {}",
                self.tz
            ))),
        }
    }

    pub fn local_time_of(&self, instant: Ms) -> Result<NaiveTime, ClockError> {
        Ok(self.to_local(instant)?.time())
    }
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(s: &str) -> Result<NaiveDate, ClockError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|_| ClockError::InvalidDateTime(format!("bad date: {s}")))
}

/// Parse an `HH:MM` time of day.
pub fn parse_time(s: &str) -> Result<NaiveTime, ClockError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|_| ClockError::InvalidDateTime(format!("bad time: {s}")))
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}
