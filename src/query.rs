// Typed reservation filters handed to the stores

use crate::model::{GuestId, ReservationId, RoomId, StayDates};
use crate::reservation::Reservation;

/// Criteria for selecting reservations. An unset criterion matches everything.
///
/// Cancelled reservations are excluded unless [`ReservationQuery::include_cancelled`]
/// is set, since they no longer hold any dates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationQuery {
    pub room_id: Option<RoomId>,
    pub guest_id: Option<GuestId>,
    pub overlapping: Option<StayDates>,
    pub exclude: Option<ReservationId>,
    pub include_cancelled: bool,
}

impl ReservationQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_room(room_id: RoomId) -> Self {
        Self {
            room_id: Some(room_id),
            ..Self::default()
        }
    }

    pub fn for_guest(guest_id: GuestId) -> Self {
        Self {
            guest_id: Some(guest_id),
            ..Self::default()
        }
    }

    pub fn overlapping(mut self, stay: StayDates) -> Self {
        self.overlapping = Some(stay);
        self
    }

    // Leave out a reservation that is being re-validated
    pub fn excluding(mut self, reservation_id: Option<ReservationId>) -> Self {
        self.exclude = reservation_id;
        self
    }

    pub fn include_cancelled(mut self) -> Self {
        self.include_cancelled = true;
        self
    }

    pub fn matches(&self, reservation: &Reservation) -> bool {
        if !self.include_cancelled && !reservation.status.is_active() {
            return false;
        }

        if !self.room_id.map_or(true, |id| reservation.room_id == id) {
            return false;
        }

        if !self.guest_id.map_or(true, |id| reservation.guest_id == id) {
            return false;
        }

        if !self
            .overlapping
            .as_ref()
            .map_or(true, |stay| reservation.stay.overlaps(stay))
        {
            return false;
        }

        self.exclude.map_or(true, |id| reservation.id != id)
    }

    // Applies the query to an in-memory collection
    pub fn filter<'a, I>(&self, reservations: I) -> Vec<Reservation>
    where
        I: IntoIterator<Item = &'a Reservation>,
    {
        reservations
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect()
    }
}
