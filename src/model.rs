use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the stored instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

pub type ServiceId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other` (closed on both ends).
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Login name of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Admin,
}

/// Who is calling: resolved by the auth layer before any engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub name: Option<String>,
    /// Length of one session in minutes.
    pub session_minutes: u32,
    pub active: bool,
}

/// Admin-declared open hours for a service, `[span.start, span.end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub service_id: ServiceId,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }

    /// Pending and confirmed bookings both occupy their slot.
    pub fn holds_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: UserId,
    pub service_id: ServiceId,
    pub span: Span,
    pub status: BookingStatus,
    pub note: Option<String>,
}

/// Everything the store keeps for one service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub service: Service,
    /// Sorted by `span.start`.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`; cancelled rows stay.
    pub bookings: Vec<Booking>,
    /// Unique index: start instant → id of the booking holding it.
    active_starts: HashMap<Ms, Ulid>,
}

impl ServiceState {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            windows: Vec::new(),
            bookings: Vec::new(),
            active_starts: HashMap::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let pos = self
            .windows
            .binary_search_by_key(&window.span.start, |w| w.span.start)
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Windows whose span overlaps `query`.
    /// Binary search skips windows starting at or after `query.end`.
    pub fn windows_overlapping(&self, query: &Span) -> impl Iterator<Item = &AvailabilityWindow> {
        let right_bound = self.windows.partition_point(|w| w.span.start < query.end);
        self.windows[..right_bound]
            .iter()
            .filter(move |w| w.span.end > query.start)
    }

    /// Slot-holding bookings whose start lies in `range`.
    pub fn bookings_starting_within(&self, range: &Span) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.span.start < range.start);
        let hi = self.bookings.partition_point(|b| b.span.start < range.end);
        self.bookings[lo..hi]
            .iter()
            .filter(|b| b.status.holds_slot())
    }

    /// Which of `starts` are already held by a non-cancelled booking.
    pub fn claimed_starts(&self, starts: &[Ms]) -> Vec<Ms> {
        starts
            .iter()
            .copied()
            .filter(|s| self.active_starts.contains_key(s))
            .collect()
    }

    pub fn is_claimed(&self, start: Ms) -> bool {
        self.active_starts.contains_key(&start)
    }

    /// Insert maintaining start order. Slot-holding bookings are indexed;
    /// returns the existing holder's id if the start is already taken.
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), Ulid> {
        if booking.status.holds_slot() {
            if let Some(holder) = self.active_starts.get(&booking.span.start) {
                return Err(*holder);
            }
            self.active_starts.insert(booking.span.start, booking.id);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
        Ok(())
    }

    /// Flip a booking to CANCELLED and free its slot. Returns the updated row.
    pub fn cancel_booking(&mut self, id: Ulid) -> Option<&Booking> {
        let booking = self.bookings.iter_mut().find(|b| b.id == id)?;
        if booking.status.holds_slot()
            && self.active_starts.get(&booking.span.start) == Some(&id)
        {
            self.active_starts.remove(&booking.span.start);
        }
        booking.status = BookingStatus::Cancelled;
        Some(booking)
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }
}

/// The WAL record format: flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        service: Service,
    },
    ServiceDeleted {
        id: ServiceId,
    },
    WindowAdded {
        window: AvailabilityWindow,
    },
    WindowRemoved {
        id: Ulid,
        service_id: ServiceId,
    },
    /// One record per commit so a batch is replayed all-or-nothing.
    BookingsConfirmed {
        service_id: ServiceId,
        bookings: Vec<Booking>,
    },
    BookingCancelled {
        id: Ulid,
        service_id: ServiceId,
    },
}

impl Event {
    /// The service an event mutates.
    pub fn service_id(&self) -> ServiceId {
        match self {
            Event::ServiceCreated { service } => service.id,
            Event::ServiceDeleted { id } => *id,
            Event::WindowAdded { window } => window.service_id,
            Event::WindowRemoved { service_id, .. }
            | Event::BookingsConfirmed { service_id, .. }
            | Event::BookingCancelled { service_id, .. } => *service_id,
        }
    }
}
