// Persistence ports used by the booking engine.
//
// The engine never talks to a database directly; it receives one store handle at
// construction time and goes through these traits. `MemoryStore` implements all
// of them in-process.

use crate::error::StoreError;
use crate::model::{Guest, GuestId, PaymentId, ReservationId, Room, RoomId, RoomType, RoomTypeId};
use crate::outbox::{OutboxEntry, OutboxId, OutboxMessage};
use crate::payment::Payment;
use crate::query::ReservationQuery;
use crate::reservation::{Reservation, ReservationDetails, ReservationStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;

// Reads needed to decide whether a booking is legal
#[async_trait]
pub trait RoomReader: Send + Sync {
    async fn find_room_by_id(&self, id: RoomId) -> Result<Option<Room>, StoreError>;

    async fn find_overlapping_reservations(
        &self,
        query: &ReservationQuery,
    ) -> Result<Vec<Reservation>, StoreError>;
}

#[async_trait]
pub trait RoomStore: RoomReader {
    // Room numbers are unique per hotel only, so several rooms may match
    async fn find_rooms_by_number(&self, room_number: &str) -> Result<Vec<Room>, StoreError>;

    async fn find_room_type(&self, id: RoomTypeId) -> Result<Option<RoomType>, StoreError>;

    /// Holds the room until `until` on behalf of `reservation_id`, touching only
    /// `is_available`, `available_from` and `updated_at` in one atomic write.
    /// The hold only grows and a withdrawn room stays withdrawn. A reservation
    /// that is no longer active leaves the room as it is.
    async fn hold_room(
        &self,
        room_id: RoomId,
        reservation_id: ReservationId,
        until: NaiveDate,
        at: DateTime<Utc>,
    ) -> Result<Room, StoreError>;

    /// Recomputes the hold from the room's active reservations that end after
    /// `at`: held until the latest check-out among them, or available when none
    /// remain. Touches the same fields as [`RoomStore::hold_room`].
    async fn release_room_hold(
        &self,
        room_id: RoomId,
        at: DateTime<Utc>,
    ) -> Result<Room, StoreError>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    // Hydrated with room, room type, hotel, guest and payment
    async fn find_guest(&self, id: GuestId) -> Result<Option<Guest>, StoreError>;

    async fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<ReservationDetails>, StoreError>;

    async fn get_reservations_by_guest(
        &self,
        guest_id: GuestId,
    ) -> Result<Vec<ReservationDetails>, StoreError>;

    /// Moves a reservation from `expected` to `next`, touching only `status` and
    /// `updated_at`, and enqueues `follow_up` in the same write. Fails with
    /// [`StoreError::StaleState`] if the stored status is no longer `expected`.
    async fn update_reservation_status(
        &self,
        id: ReservationId,
        expected: ReservationStatus,
        next: ReservationStatus,
        follow_up: &[OutboxMessage],
        at: DateTime<Utc>,
    ) -> Result<Reservation, StoreError>;

    // Applies a payment settlement and the matching reservation transition together
    async fn record_settlement(&self, settlement: &SettlementWrite) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>, StoreError>;

    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` entries whose next attempt is due, leasing them for
    /// `lease` so that concurrent relays skip them. A lease that runs out makes
    /// the entry claimable again.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    async fn mark_delivered(&self, id: OutboxId, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn reschedule(
        &self,
        id: OutboxId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_dead(&self, id: OutboxId, error: &str) -> Result<(), StoreError>;

    async fn get_outbox_entry(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError>;
}

/// Unit of work for creating a reservation.
///
/// Holds an exclusive lock on one room for its whole lifetime, so availability
/// read through it cannot change before `commit`. Staged writes are applied all
/// together on commit, or not at all if the transaction is dropped.
#[async_trait]
pub trait BookingTransaction: RoomReader {
    fn room_id(&self) -> RoomId;

    fn stage_payment(&mut self, payment: Payment);

    fn stage_reservation(&mut self, reservation: Reservation);

    // Written to the outbox in the same commit as the staged records
    fn enqueue(&mut self, message: OutboxMessage);

    /// Applies staged writes. Rejects with [`StoreError::Conflict`] when a staged
    /// reservation overlaps an active one for the same room, or a payment reuses
    /// a transaction id.
    async fn commit(self: Box<Self>, now: DateTime<Utc>) -> Result<(), StoreError>;
}

// The single handle the engine is constructed with
#[async_trait]
pub trait BookingStore:
    RoomStore + ReservationStore + PaymentStore + OutboxStore + 'static
{
    async fn begin(&self, room_id: RoomId) -> Result<Box<dyn BookingTransaction>, StoreError>;
}

// Settlement written by `ReservationStore::record_settlement`
#[derive(Debug, Clone)]
pub struct SettlementWrite {
    pub reservation_id: ReservationId,
    pub expected: ReservationStatus,
    pub next: ReservationStatus,
    // Payment as it should be stored; the stored copy must still be pending
    pub payment: Payment,
    // Enqueued together with the settlement
    pub follow_up: Vec<OutboxMessage>,
    pub at: DateTime<Utc>,
}
