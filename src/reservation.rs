// Reservation records and the status state machine
//
//   PENDING -> CONFIRMED -> IN_PROGRESS -> COMPLETED
//      |           |
//      +-----------+--> CANCELLED

use crate::error::TransitionError;
use crate::model::{
    Guest, GuestId, Hotel, PaymentId, ReservationId, Room, RoomId, RoomType, StayDates,
};
use crate::payment::Payment;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::InProgress => "IN_PROGRESS",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    // Every status except CANCELLED occupies the room's dates
    pub fn is_active(&self) -> bool {
        *self != ReservationStatus::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed | ReservationStatus::Cancelled
        )
    }

    /// Computes the status reached by applying `action`, without side effects.
    ///
    /// Cancelling an already cancelled reservation is reported as
    /// [`TransitionError::AlreadyCancelled`] rather than succeeding silently.
    pub fn apply(self, action: LifecycleAction) -> Result<ReservationStatus, TransitionError> {
        if action == LifecycleAction::Cancel && self == ReservationStatus::Cancelled {
            return Err(TransitionError::AlreadyCancelled);
        }
        if !action.allowed_from().contains(&self) {
            return Err(TransitionError::NotAllowed {
                action,
                expected: action.allowed_from(),
                actual: self,
            });
        }
        Ok(action.target())
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleAction {
    // Driven by payment settlement only
    Confirm,
    Cancel,
    CheckIn,
    CheckOut,
}

impl LifecycleAction {
    pub fn allowed_from(&self) -> &'static [ReservationStatus] {
        match self {
            LifecycleAction::Confirm => &[ReservationStatus::Pending],
            LifecycleAction::Cancel => &[ReservationStatus::Pending, ReservationStatus::Confirmed],
            LifecycleAction::CheckIn => &[ReservationStatus::Confirmed],
            LifecycleAction::CheckOut => &[ReservationStatus::InProgress],
        }
    }

    pub fn target(&self) -> ReservationStatus {
        match self {
            LifecycleAction::Confirm => ReservationStatus::Confirmed,
            LifecycleAction::Cancel => ReservationStatus::Cancelled,
            LifecycleAction::CheckIn => ReservationStatus::InProgress,
            LifecycleAction::CheckOut => ReservationStatus::Completed,
        }
    }
}

impl fmt::Display for LifecycleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleAction::Confirm => "confirm",
            LifecycleAction::Cancel => "cancel",
            LifecycleAction::CheckIn => "check-in",
            LifecycleAction::CheckOut => "check-out",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room_id: RoomId,
    pub guest_id: GuestId,
    pub stay: StayDates,
    pub num_guests: u32,
    pub special_request: Option<String>,
    pub total_price: Decimal,
    pub status: ReservationStatus,
    pub payment_id: PaymentId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn check_in(&self) -> NaiveDate {
        self.stay.check_in()
    }

    pub fn check_out(&self) -> NaiveDate {
        self.stay.check_out()
    }

    // True when this reservation holds dates that collide with `stay`
    pub fn blocks(&self, stay: &StayDates) -> bool {
        self.status.is_active() && self.stay.overlaps(stay)
    }
}

// Reservation joined with everything a caller or a notification needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationDetails {
    pub reservation: Reservation,
    pub room: Room,
    pub room_type: RoomType,
    pub hotel: Hotel,
    pub guest: Guest,
    pub payment: Payment,
}
