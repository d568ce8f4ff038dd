use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::{now_ms, parse_date, parse_time};
use crate::limits::*;
use crate::model::*;
use crate::store::{InsertOutcome, StoreError};

use super::{BookingError, Engine};

/// A commit request as it arrives from the wire, date and time still text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub service_id: ServiceId,
    pub date: String,
    pub start_time: String,
    pub sessions: u32,
    pub note: Option<String>,
}

impl Engine {
    /// Validate and atomically book `sessions` back-to-back sessions.
    /// All sessions are written or none is.
    pub async fn commit_booking(
        &self,
        who: &Identity,
        req: BookingRequest,
    ) -> Result<Vec<Booking>, BookingError> {
        let result = self.commit_booking_at(who, req, now_ms()).await;
        match &result {
            Ok(rows) => {
                metrics::counter!(crate::observability::BOOKINGS_COMMITTED_TOTAL)
                    .increment(rows.len() as u64);
            }
            Err(BookingError::Conflict(_)) => {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            }
            Err(e) => {
                metrics::counter!(crate::observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.kind())
                    .increment(1);
            }
        }
        result
    }

    pub(crate) async fn commit_booking_at(
        &self,
        who: &Identity,
        req: BookingRequest,
        now: Ms,
    ) -> Result<Vec<Booking>, BookingError> {
        if who.user_id.as_str().is_empty() {
            return Err(BookingError::Unauthenticated);
        }

        // 1. Real local date-time.
        let date = parse_date(&req.date)?;
        let start = parse_time(&req.start_time)?;
        if req.sessions == 0 || req.sessions > MAX_SESSIONS_PER_BOOKING {
            return Err(BookingError::InvalidInput(format!(
                "sessions must be between 1 and {MAX_SESSIONS_PER_BOOKING}"
            )));
        }
        if req.note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(BookingError::InvalidInput("note too long".into()));
        }
        let first_start = self.clock.to_instant(date, start)?;

        // 2. Grid alignment. Starts before opening are reported by the
        // business-hours check instead.
        if start >= self.rules.day_start && !self.rules.is_on_grid(&date.and_time(start)) {
            debug!("reject {}: {start} off grid", req.service_id);
            return Err(BookingError::NotOnGrid(start));
        }

        // 3. Every session ends by closing time.
        self.rules
            .fits_business_hours(start, req.sessions)
            .map_err(BookingError::OutsideBusinessHours)?;

        // 4.
        if first_start < now {
            return Err(BookingError::InThePast);
        }

        // 5.
        let service = self.bookable_service(req.service_id).await?;

        // 6.
        let starts = self
            .rules
            .expand_session_starts(&self.clock, date, start, req.sessions)?;

        // 7. Each session [start, end] inside one window.
        let session = self.rules.session_ms();
        let last_end = starts.last().map_or(first_start, |s| s + session);
        let windows = self
            .store
            .find_windows_overlapping(service.id, Span::new(first_start, last_end))
            .await?;
        let uncovered = starts.iter().copied().find(|&s| {
            let slot = Span::new(s, s + session);
            !windows.iter().any(|w| w.span.contains_span(&slot))
        });
        if let Some(s) = uncovered {
            return Err(BookingError::NotWithinAvailability(self.clock.local_time_of(s)?));
        }

        // 8. Re-check and insert as one unit in the store.
        let rows: Vec<Booking> = starts
            .iter()
            .map(|&s| Booking {
                id: Ulid::new(),
                user_id: who.user_id.clone(),
                service_id: service.id,
                span: Span::new(s, s + session),
                status: BookingStatus::Confirmed,
                note: req.note.clone(),
            })
            .collect();

        match self.store.insert_bookings_if_none_exist(service.id, rows).await {
            Ok(InsertOutcome::Inserted(created)) => {
                info!(
                    "booked {} session(s) on {} for {} starting {date} {start}",
                    created.len(),
                    service.id,
                    who.user_id
                );
                Ok(created)
            }
            Ok(InsertOutcome::AlreadyClaimed(held))
            | Err(StoreError::UniqueViolation { starts: held, .. }) => {
                warn!(
                    "conflict on {} for {}: {} start(s) already held",
                    service.id,
                    who.user_id,
                    held.len()
                );
                Err(BookingError::Conflict(self.local_times(&held)?))
            }
            Err(e) => Err(e.into()),
        }
    }
}
