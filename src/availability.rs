// Availability checker: decides whether a room can take a stay

use crate::error::{BookingError, StoreError, UnavailableReason};
use crate::model::{ReservationId, Room, RoomId, StayDates};
use crate::query::ReservationQuery;
use crate::store::RoomReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    // Active reservations overlapping the requested stay
    Conflict(Vec<ReservationId>),
    RoomUnavailable(UnavailableReason),
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available)
    }

    pub fn into_result(self, room_id: RoomId) -> Result<(), BookingError> {
        match self {
            Availability::Available => Ok(()),
            Availability::Conflict(conflicting) => Err(BookingError::Conflict {
                room_id,
                conflicting,
            }),
            Availability::RoomUnavailable(reason) => {
                Err(BookingError::RoomUnavailable { room_id, reason })
            }
        }
    }
}

/// Checks `stay` against the room's reservations first, then against the
/// room's own flags.
///
/// Read-only. To make the result hold until a write, run it through a
/// [`BookingTransaction`](crate::store::BookingTransaction) for the same room.
pub async fn check_availability<R>(
    reader: &R,
    room_id: RoomId,
    stay: &StayDates,
    exclude: Option<ReservationId>,
) -> Result<Availability, StoreError>
where
    R: RoomReader + ?Sized,
{
    let query = ReservationQuery::for_room(room_id)
        .overlapping(*stay)
        .excluding(exclude);
    let conflicting: Vec<ReservationId> = reader
        .find_overlapping_reservations(&query)
        .await?
        .into_iter()
        // Stores may over-select; the half-open rule decides
        .filter(|r| r.blocks(stay) && Some(r.id) != exclude)
        .map(|r| r.id)
        .collect();
    if !conflicting.is_empty() {
        return Ok(Availability::Conflict(conflicting));
    }

    let room = reader
        .find_room_by_id(room_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;

    Ok(match room_state(&room, stay) {
        Some(reason) => Availability::RoomUnavailable(reason),
        None => Availability::Available,
    })
}

fn room_state(room: &Room, stay: &StayDates) -> Option<UnavailableReason> {
    if room.under_maintenance {
        return Some(UnavailableReason::UnderMaintenance);
    }
    if room.is_available {
        return None;
    }
    match room.available_from {
        Some(held_until) if held_until > stay.check_in() => {
            Some(UnavailableReason::HeldUntil(held_until))
        }
        Some(_) => None,
        None => Some(UnavailableReason::Withdrawn),
    }
}
