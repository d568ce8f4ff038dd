mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The per-service unique index on slot-holding start instants rejected a write.
    UniqueViolation {
        service_id: ServiceId,
        starts: Vec<Ms>,
    },
    InvalidWindow(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            StoreError::UniqueViolation { service_id, starts } => write!(
                f,
                "unique violation on service {service_id}: starts {starts:?} already held"
            ),
            StoreError::InvalidWindow(msg) => write!(f, "invalid window: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of the transactional re-check-then-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// All rows written, ordered by start.
    Inserted(Vec<Booking>),
    /// Nothing written; these starts are already held.
    AlreadyClaimed(Vec<Ms>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub service_id: Option<ServiceId>,
    pub user_id: Option<UserId>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.service_id.is_none_or(|s| booking.service_id == s)
            && self.user_id.as_ref().is_none_or(|u| &booking.user_id == u)
    }
}

/// Persistence collaborator: reads for the resolver, the single transactional
/// booking write, and the administrative writes.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn find_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError>;

    async fn list_services(&self) -> Result<Vec<Service>, StoreError>;

    /// Windows with `start < span.end && end > span.start`, ordered by start.
    async fn find_windows_overlapping(
        &self,
        service_id: ServiceId,
        span: Span,
    ) -> Result<Vec<AvailabilityWindow>, StoreError>;

    /// Non-cancelled bookings whose start lies in `[range.start, range.end)`.
    async fn find_bookings_starting_within(
        &self,
        service_id: ServiceId,
        range: Span,
    ) -> Result<Vec<Booking>, StoreError>;

    /// Atomically: if any of the bookings' starts is already held, write
    /// nothing and report the held starts; otherwise write all of them.
    async fn insert_bookings_if_none_exist(
        &self,
        service_id: ServiceId,
        bookings: Vec<Booking>,
    ) -> Result<InsertOutcome, StoreError>;

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError>;

    /// Mark a booking CANCELLED and release its slot. Idempotent.
    async fn cancel_booking(&self, id: Ulid) -> Result<Booking, StoreError>;

    async fn create_service(&self, service: Service) -> Result<(), StoreError>;

    /// Removes the service together with its windows and bookings.
    async fn delete_service(&self, id: ServiceId) -> Result<(), StoreError>;

    /// All-or-nothing insert of windows (may span services).
    async fn add_windows(&self, windows: Vec<AvailabilityWindow>) -> Result<(), StoreError>;

    async fn remove_window(&self, id: Ulid) -> Result<ServiceId, StoreError>;
}
