// Error types surfaced by the booking engine and its stores

use crate::model::{ReservationId, RoomId};
use crate::payment::PaymentStatus;
use crate::reservation::{LifecycleAction, ReservationStatus};
use chrono::NaiveDate;
use std::fmt;
use thiserror::Error;

// Why a room refuses bookings independently of other reservations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    UnderMaintenance,
    HeldUntil(NaiveDate),
    // Marked unavailable with no release date
    Withdrawn,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::UnderMaintenance => write!(f, "room is under maintenance"),
            UnavailableReason::HeldUntil(date) => write!(f, "room is held until {}", date),
            UnavailableReason::Withdrawn => write!(f, "room is not available for booking"),
        }
    }
}

// Errors returned to callers of the booking engine
#[derive(Error, Debug)]
pub enum BookingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Room {room_id} is not available for the selected dates")]
    Conflict {
        room_id: RoomId,
        // Empty when the store rejected the write at commit time
        conflicting: Vec<ReservationId>,
    },

    #[error("Room {room_id} is unavailable: {reason}")]
    RoomUnavailable {
        room_id: RoomId,
        reason: UnavailableReason,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Reservation {0} is already cancelled")]
    AlreadyCancelled(ReservationId),

    #[error("Cannot {action} reservation {reservation_id}: must be {}, found {actual}", join_states(.expected))]
    InvalidTransition {
        reservation_id: ReservationId,
        action: LifecycleAction,
        expected: &'static [ReservationStatus],
        actual: ReservationStatus,
    },

    #[error("Payment for reservation {reservation_id} cannot be settled: it is {status}")]
    PaymentNotPending {
        reservation_id: ReservationId,
        status: PaymentStatus,
    },

    // Details are logged where the failure happens, never returned
    #[error("Internal error")]
    Internal,
}

impl BookingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BookingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    // Caller may retry with other dates or another room
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BookingError::Conflict { .. } | BookingError::RoomUnavailable { .. }
        )
    }

    pub(crate) fn from_transition(reservation_id: ReservationId, error: TransitionError) -> Self {
        match error {
            TransitionError::AlreadyCancelled => BookingError::AlreadyCancelled(reservation_id),
            TransitionError::NotAllowed {
                action,
                expected,
                actual,
            } => BookingError::InvalidTransition {
                reservation_id,
                action,
                expected,
                actual,
            },
            TransitionError::PaymentNotPending(status) => BookingError::PaymentNotPending {
                reservation_id,
                status,
            },
        }
    }
}

// Rejected state change, before any reservation context is attached
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("reservation is already cancelled")]
    AlreadyCancelled,

    #[error("reservation must be {} before {action} (currently {actual})", join_states(.expected))]
    NotAllowed {
        action: LifecycleAction,
        expected: &'static [ReservationStatus],
        actual: ReservationStatus,
    },

    #[error("payment is {0}, only pending payments can be settled")]
    PaymentNotPending(PaymentStatus),
}

// Persistence failures reported by store implementations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    // Exclusion or uniqueness constraint violated at write time
    #[error("Constraint violation: {0}")]
    Conflict(String),

    // A compare-and-set found a different state than expected
    #[error("Stale state: {0}")]
    StaleState(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}

fn join_states(states: &[ReservationStatus]) -> String {
    states
        .iter()
        .map(ReservationStatus::as_str)
        .collect::<Vec<_>>()
        .join(" or ")
}
