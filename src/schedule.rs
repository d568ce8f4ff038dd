use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::clock::{BusinessClock, ClockError};
use crate::model::Ms;

/// Fixed scheduling grid, in business-local time.
///
/// Sessions start on `day_start + k * step` where `step = session + buffer`.
/// `day_end` bounds the end of the last session, not its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingRules {
    pub session_minutes: u32,
    pub buffer_minutes: u32,
    pub day_start: NaiveTime,
    pub day_end: NaiveTime,
}

impl Default for SchedulingRules {
    fn default() -> Self {
        Self {
            session_minutes: 15,
            buffer_minutes: 5,
            day_start: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            day_end: NaiveTime::from_hms_opt(15, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoursViolation {
    BeforeOpening { start: NaiveTime, opens: NaiveTime },
    /// `last_end` is minutes since midnight and may exceed one day.
    AfterClosing { last_end_minutes: u32, closes: NaiveTime },
}

impl std::fmt::Display for HoursViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoursViolation::BeforeOpening { start, opens } => write!(
                f,
                "start {} is before opening time {}",
                start.format("%H:%M"),
                opens.format("%H:%M")
            ),
            HoursViolation::AfterClosing { last_end_minutes, closes } => write!(
                f,
                "last session would end at {:02}:{:02}, after closing time {}",
                last_end_minutes / 60,
                last_end_minutes % 60,
                closes.format("%H:%M")
            ),
        }
    }
}

fn minutes_of(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

impl SchedulingRules {
    pub fn step_minutes(&self) -> u32 {
        self.session_minutes + self.buffer_minutes
    }

    pub fn session_ms(&self) -> Ms {
        Ms::from(self.session_minutes) * crate::model::MINUTE_MS
    }

    /// True iff `local` sits a non-negative whole number of steps after
    /// opening on its own calendar date.
    pub fn is_on_grid(&self, local: &NaiveDateTime) -> bool {
        let t = local.time();
        if t.second() != 0 || t.nanosecond() != 0 || t < self.day_start {
            return false;
        }
        let elapsed = minutes_of(t) - minutes_of(self.day_start);
        let step = self.step_minutes();
        step > 0 && elapsed % step == 0
    }

    /// Check that `sessions` back-to-back sessions starting at `start` all
    /// end by closing time. Ending exactly at closing is allowed.
    pub fn fits_business_hours(&self, start: NaiveTime, sessions: u32) -> Result<(), HoursViolation> {
        if start < self.day_start {
            return Err(HoursViolation::BeforeOpening {
                start,
                opens: self.day_start,
            });
        }
        let last_start = minutes_of(start) + sessions.saturating_sub(1) * self.step_minutes();
        let last_end = last_start + self.session_minutes;
        if last_end > minutes_of(self.day_end) {
            return Err(HoursViolation::AfterClosing {
                last_end_minutes: last_end,
                closes: self.day_end,
            });
        }
        Ok(())
    }

    /// Local start time of each of the `sessions` sessions.
    pub fn session_local_starts(&self, date: NaiveDate, start: NaiveTime, sessions: u32) -> Vec<NaiveDateTime> {
        let first = date.and_time(start);
        let step = Duration::minutes(i64::from(self.step_minutes()));
        (0..sessions)
            .map(|i| first + step * i as i32)
            .collect()
    }

    /// Start instants of each of the `sessions` sessions, in order.
    pub fn expand_session_starts(
        &self,
        clock: &BusinessClock,
        date: NaiveDate,
        start: NaiveTime,
        sessions: u32,
    ) -> Result<Vec<Ms>, ClockError> {
        self.session_local_starts(date, start, sessions)
            .iter()
            .map(|local| clock.local_to_instant(local))
            .collect()
    }

    /// Every grid start strictly before `day_end`, ascending.
    pub fn grid_starts(&self) -> Vec<NaiveTime> {
        let step = self.step_minutes();
        if step == 0 {
            return Vec::new();
        }
        let open = minutes_of(self.day_start);
        let close = minutes_of(self.day_end);
        (open..close)
            .step_by(step as usize)
            .filter_map(|m| NaiveTime::from_hms_opt(m / 60, m % 60, 0))
            .collect()
    }
}
