mod admin;
mod availability;
mod commit;
mod error;

pub use admin::WindowRequest;
pub use commit::BookingRequest;
pub use error::{BookingError, Unavailable};

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};

use crate::clock::BusinessClock;
use crate::model::*;
use crate::schedule::SchedulingRules;
use crate::store::BookingStore;

/// Booking view with instants rendered in business-local time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalBooking {
    pub booking: Booking,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// Availability resolver and booking committer over a store.
pub struct Engine {
    store: Arc<dyn BookingStore>,
    rules: SchedulingRules,
    clock: BusinessClock,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingStore>, rules: SchedulingRules, clock: BusinessClock) -> Self {
        Self { store, rules, clock }
    }

    pub fn rules(&self) -> &SchedulingRules {
        &self.rules
    }

    pub fn clock(&self) -> &BusinessClock {
        &self.clock
    }

    /// Load a service that can take bookings on this grid.
    async fn bookable_service(&self, id: ServiceId) -> Result<Service, BookingError> {
        let service = self
            .store
            .find_service(id)
            .await?
            .ok_or(BookingError::ServiceUnavailable {
                id,
                reason: Unavailable::Missing,
            })?;
        if !service.active {
            return Err(BookingError::ServiceUnavailable {
                id,
                reason: Unavailable::Inactive,
            });
        }
        if service.session_minutes != self.rules.session_minutes {
            return Err(BookingError::ServiceUnavailable {
                id,
                reason: Unavailable::UnsupportedDuration {
                    minutes: service.session_minutes,
                    supported: self.rules.session_minutes,
                },
            });
        }
        Ok(service)
    }

    fn local_times(&self, instants: &[Ms]) -> Result<Vec<NaiveTime>, BookingError> {
        instants
            .iter()
            .map(|&ms| self.clock.local_time_of(ms).map_err(BookingError::from))
            .collect()
    }

    pub fn localize(&self, booking: Booking) -> Result<LocalBooking, BookingError> {
        let start = self.clock.to_local(booking.span.start)?;
        let end = self.clock.to_local(booking.span.end)?;
        Ok(LocalBooking {
            date: start.date(),
            start_time: start.time(),
            end_time: end.time(),
            booking,
        })
    }
}
