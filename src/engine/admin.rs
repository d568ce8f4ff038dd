use tracing::info;
use ulid::Ulid;

use crate::clock::{parse_date, parse_time};
use crate::limits::*;
use crate::model::*;
use crate::store::BookingFilter;

use super::{BookingError, Engine};

/// A window declared in business-local time on one calendar date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub id: Ulid,
    pub service_id: ServiceId,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
}

fn require_admin(who: &Identity, what: &'static str) -> Result<(), BookingError> {
    if who.is_admin() {
        Ok(())
    } else {
        Err(BookingError::Forbidden(what))
    }
}

impl Engine {
    pub async fn list_services(&self) -> Result<Vec<Service>, BookingError> {
        Ok(self.store.list_services().await?)
    }

    pub async fn create_service(&self, who: &Identity, service: Service) -> Result<(), BookingError> {
        require_admin(who, "create service")?;
        if service.session_minutes == 0 {
            return Err(BookingError::InvalidInput("session_minutes must be positive".into()));
        }
        if service.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(BookingError::InvalidInput("service name too long".into()));
        }
        let id = service.id;
        self.store.create_service(service).await?;
        info!("service {id} created by {}", who.user_id);
        Ok(())
    }

    pub async fn delete_service(&self, who: &Identity, id: ServiceId) -> Result<(), BookingError> {
        require_admin(who, "delete service")?;
        self.store.delete_service(id).await?;
        info!("service {id} deleted by {}", who.user_id);
        Ok(())
    }

    /// Convert local windows to instants and store them all or none.
    pub async fn add_windows(&self, who: &Identity, requests: Vec<WindowRequest>) -> Result<(), BookingError> {
        require_admin(who, "add availability window")?;
        let mut windows = Vec::with_capacity(requests.len());
        for req in &requests {
            let date = parse_date(&req.date)?;
            let start = parse_time(&req.start_time)?;
            let end = parse_time(&req.end_time)?;
            if start >= end {
                return Err(BookingError::InvalidInput(format!(
                    "window {}: start {} must be before end {}",
                    req.id, req.start_time, req.end_time
                )));
            }
            let span = Span::new(self.clock.to_instant(date, start)?, self.clock.to_instant(date, end)?);
            windows.push(AvailabilityWindow {
                id: req.id,
                service_id: req.service_id,
                span,
            });
        }
        let count = windows.len();
        self.store.add_windows(windows).await?;
        info!("{count} window(s) added by {}", who.user_id);
        Ok(())
    }

    pub async fn remove_window(&self, who: &Identity, id: Ulid) -> Result<ServiceId, BookingError> {
        require_admin(who, "remove availability window")?;
        Ok(self.store.remove_window(id).await?)
    }

    /// Customers see their own bookings; admins see everyone's.
    pub async fn list_bookings(
        &self,
        who: &Identity,
        service_id: Option<ServiceId>,
    ) -> Result<Vec<Booking>, BookingError> {
        let filter = BookingFilter {
            service_id,
            user_id: (!who.is_admin()).then(|| who.user_id.clone()),
        };
        Ok(self.store.list_bookings(&filter).await?)
    }

    /// Owner or admin may cancel. The row stays with status CANCELLED.
    pub async fn cancel_booking(&self, who: &Identity, id: Ulid) -> Result<Booking, BookingError> {
        let booking = self
            .store
            .find_booking(id)
            .await?
            .ok_or(BookingError::NotFound(id))?;
        if booking.user_id != who.user_id && !who.is_admin() {
            return Err(BookingError::Forbidden("cancel another user's booking"));
        }
        let cancelled = self.store.cancel_booking(id).await?;
        info!("booking {id} cancelled by {}", who.user_id);
        Ok(cancelled)
    }
}
