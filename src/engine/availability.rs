use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};
use tracing::debug;

use crate::clock::now_ms;
use crate::model::*;

use super::{BookingError, Engine};

impl Engine {
    /// Grid-aligned local start times on `date` that sit fully inside some
    /// availability window and are not held by a live booking. Ascending.
    pub async fn compute_available_starts(
        &self,
        service_id: ServiceId,
        date: NaiveDate,
    ) -> Result<Vec<NaiveTime>, BookingError> {
        self.available_starts_at(service_id, date, now_ms()).await
    }

    /// As `compute_available_starts`, with starts before `now` left out.
    pub(crate) async fn available_starts_at(
        &self,
        service_id: ServiceId,
        date: NaiveDate,
        now: Ms,
    ) -> Result<Vec<NaiveTime>, BookingError> {
        self.bookable_service(service_id).await?;

        let day_start = self.clock.to_instant(date, self.rules.day_start)?;
        let day_end = self.clock.to_instant(date, self.rules.day_end)?;
        if day_end <= day_start {
            return Ok(Vec::new());
        }
        let day = Span::new(day_start, day_end);

        let windows = self.store.find_windows_overlapping(service_id, day).await?;
        if windows.is_empty() {
            return Ok(Vec::new());
        }
        let booked: HashSet<Ms> = self
            .store
            .find_bookings_starting_within(service_id, day)
            .await?
            .into_iter()
            .map(|b| b.span.start)
            .collect();

        let session = self.rules.session_ms();
        let mut free = Vec::new();
        for candidate in self.rules.grid_starts() {
            if self.rules.fits_business_hours(candidate, 1).is_err() {
                continue;
            }
            // Civil times that do not exist on this date have no slot.
            let Ok(start) = self.clock.to_instant(date, candidate) else {
                continue;
            };
            if start < now || booked.contains(&start) {
                continue;
            }
            let slot = Span::new(start, start + session);
            if windows.iter().any(|w| w.span.contains_span(&slot)) {
                free.push(candidate);
            }
        }

        debug!(
            "availability {service_id} {date}: {} of {} grid starts free",
            free.len(),
            self.rules.grid_starts().len()
        );
        Ok(free)
    }
}
