use chrono::NaiveTime;
use ulid::Ulid;

use crate::clock::ClockError;
use crate::model::ServiceId;
use crate::schedule::HoursViolation;
use crate::store::StoreError;

/// Why a service cannot take bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    Missing,
    Inactive,
    /// Session length differs from the grid's session length.
    UnsupportedDuration { minutes: u32, supported: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    InvalidInput(String),
    NotOnGrid(NaiveTime),
    OutsideBusinessHours(HoursViolation),
    InThePast,
    ServiceUnavailable {
        id: ServiceId,
        reason: Unavailable,
    },
    /// First session start (local) not fully covered by any window.
    NotWithinAvailability(NaiveTime),
    /// Local start times another booking already holds.
    Conflict(Vec<NaiveTime>),
    Unauthenticated,
    Forbidden(&'static str),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    /// Unexpected persistence failure. Detail is for logs only.
    Internal(String),
}

impl BookingError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::InvalidInput(_) => "invalid_input",
            BookingError::NotOnGrid(_) => "not_on_grid",
            BookingError::OutsideBusinessHours(_) => "outside_business_hours",
            BookingError::InThePast => "in_the_past",
            BookingError::ServiceUnavailable { .. } => "service_unavailable",
            BookingError::NotWithinAvailability(_) => "not_within_availability",
            BookingError::Conflict(_) => "conflict",
            BookingError::Unauthenticated => "unauthenticated",
            BookingError::Forbidden(_) => "forbidden",
            BookingError::NotFound(_) => "not_found",
            BookingError::AlreadyExists(_) => "already_exists",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::Internal(_) => "internal",
        }
    }
}

fn join_times(times: &[NaiveTime]) -> String {
    times
        .iter()
        .map(|t| t.format("%H:%M").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Display for BookingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            BookingError::NotOnGrid(t) => {
                write!(f, "start time {} is not on the booking grid", t.format("%H:%M"))
            }
            BookingError::OutsideBusinessHours(v) => write!(f, "outside business hours: {v}"),
            BookingError::InThePast => write!(f, "start time is in the past"),
            BookingError::ServiceUnavailable { id, reason } => match reason {
                Unavailable::Missing => write!(f, "service {id} does not exist"),
                Unavailable::Inactive => write!(f, "service {id} is not active"),
                Unavailable::UnsupportedDuration { minutes, supported } => write!(
                    f,
                    "service {id} has {minutes}-minute sessions; only {supported}-minute sessions can be booked"
                ),
            },
            BookingError::NotWithinAvailability(t) => write!(
                f,
                "session at {} is not within the service's availability",
                t.format("%H:%M")
            ),
            BookingError::Conflict(times) => {
                write!(f, "already booked: {}", join_times(times))
            }
            BookingError::Unauthenticated => write!(f, "authentication required"),
            BookingError::Forbidden(what) => write!(f, "permission denied: {what}"),
            BookingError::NotFound(id) => write!(f, "not found: {id}"),
            BookingError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            BookingError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            BookingError::Internal(_) => write!(f, "internal error"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<ClockError> for BookingError {
    fn from(e: ClockError) -> Self {
        BookingError::InvalidInput(e.to_string())
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            StoreError::AlreadyExists(id) => BookingError::AlreadyExists(id),
            StoreError::InvalidWindow(msg) => BookingError::InvalidInput(msg),
            StoreError::LimitExceeded(msg) => BookingError::LimitExceeded(msg),
            other @ (StoreError::UniqueViolation { .. } | StoreError::WalError(_)) => {
                BookingError::Internal(other.to_string())
            }
        }
    }
}
